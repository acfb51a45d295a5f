//! Built-in pointer image
//!
//! The cursor is an ordinary scene node pinned above every window. Its image
//! is a classic arrow kept as a small bitmap and scaled to the configured
//! height. The hot spot is the top-left pixel.

use crate::geometry::{Color, Size};
use crate::image::Image;

/// `#` outline, `.` fill, space transparent
const ARROW: [&str; 19] = [
    "#           ",
    "##          ",
    "#.#         ",
    "#..#        ",
    "#...#       ",
    "#....#      ",
    "#.....#     ",
    "#......#    ",
    "#.......#   ",
    "#........#  ",
    "#.........# ",
    "#......#####",
    "#...#..#    ",
    "#..# #..#   ",
    "#.#  #..#   ",
    "##    #..#  ",
    "#     #..#  ",
    "       #..# ",
    "       ###  ",
];

const ARROW_WIDTH: i32 = 12;
const ARROW_HEIGHT: i32 = ARROW.len() as i32;

/// Smallest cursor height accepted
pub const MIN_CURSOR_SIZE: u32 = 8;

fn arrow_image() -> Option<Image> {
    let mut image = Image::new(Size::new(ARROW_WIDTH, ARROW_HEIGHT))?;
    for (y, row) in ARROW.iter().enumerate() {
        for (x, c) in row.bytes().enumerate() {
            let color = match c {
                b'#' => Color::BLACK,
                b'.' => Color::WHITE,
                _ => continue,
            };
            image.set_pixel(x as i32, y as i32, color.to_argb());
        }
    }
    Some(image)
}

/// The arrow scaled so its height is `size` pixels
pub fn cursor_image(size: u32) -> Option<Image> {
    let height = size.max(MIN_CURSOR_SIZE) as i32;
    let width = (height * ARROW_WIDTH + ARROW_HEIGHT - 1) / ARROW_HEIGHT;
    arrow_image()?.scaled(Size::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_have_uniform_width() {
        assert!(ARROW.iter().all(|row| row.len() == ARROW_WIDTH as usize));
    }

    #[test]
    fn native_size_keeps_bitmap() {
        let img = cursor_image(ARROW_HEIGHT as u32).unwrap();
        assert_eq!(img.size(), Size::new(12, 19));
        assert_eq!(img.pixel(0, 0), Some(Color::BLACK.to_argb()));
        assert_eq!(img.pixel(1, 3), Some(Color::WHITE.to_argb()));
        assert_eq!(img.pixel(11, 0), Some(Color::TRANSPARENT.to_argb()));
    }

    #[test]
    fn scales_to_requested_height() {
        let img = cursor_image(38).unwrap();
        assert_eq!(img.size(), Size::new(24, 38));
        let tiny = cursor_image(1).unwrap();
        assert_eq!(tiny.height(), MIN_CURSOR_SIZE as i32);
    }
}
