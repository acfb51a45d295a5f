//! Shared-memory pixel buffers
//!
//! A window can hand out POSIX shared-memory segments sized to its content.
//! The client maps the segment, takes the advisory lock, writes ARGB32
//! pixels (native-endian `u32`, stride = width * 4) and drops the lock.
//! The compositor then copies a region out under the same lock.
//!
//! Segments are unlinked when the owning `SharedBuffer` is dropped.

use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::{MmapMut, MmapOptions};
use rustix::fs::{FlockOperation, Mode};
use rustix::shm::ShmOFlags;
use serde::{Deserialize, Serialize};

use crate::geometry::{Rect, Size};
use crate::image::Image;

/// Bytes per ARGB32 pixel
pub const BYTES_PER_PIXEL: usize = 4;

static NEXT_SEGMENT: AtomicU32 = AtomicU32::new(0);

/// Errors from shared-memory operations
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("invalid segment size {0}x{1}")]
    InvalidSize(i32, i32),

    #[error("failed to create segment {key}: {source}")]
    Create {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open segment {key}: {source}")]
    Open {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to map segment {key}: {source}")]
    Map {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("segment {0} is locked by another process")]
    Locked(String),

    #[error("unknown segment {0}")]
    UnknownKey(String),
}

/// What a client needs to attach to a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmInfo {
    pub key: String,
    pub width: i32,
    pub height: i32,
    /// Row length in bytes
    pub stride: usize,
    /// Total segment length in bytes
    pub len: usize,
}

impl ShmInfo {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

fn segment_len(size: Size) -> Result<usize, ShmError> {
    if size.is_empty() {
        return Err(ShmError::InvalidSize(size.width, size.height));
    }
    Ok(size.width as usize * size.height as usize * BYTES_PER_PIXEL)
}

/// A fresh segment name, unique within this process
pub fn next_key() -> String {
    let n = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
    format!("/stone-{}-{}", std::process::id(), n)
}

/// A mapped shared-memory segment holding one ARGB32 image
pub struct SharedBuffer {
    key: String,
    size: Size,
    file: File,
    map: MmapMut,
    /// The creator unlinks the name on drop
    owner: bool,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish()
    }
}

impl SharedBuffer {
    /// Create and map a new segment under `key`
    pub fn create(key: &str, size: Size) -> Result<Self, ShmError> {
        let len = segment_len(size)?;
        let create_err = |e: rustix::io::Errno| ShmError::Create {
            key: key.to_string(),
            source: e.into(),
        };
        let fd = rustix::shm::shm_open(
            key,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(create_err)?;
        if let Err(e) = rustix::fs::ftruncate(&fd, len as u64) {
            let _ = rustix::shm::shm_unlink(key);
            return Err(create_err(e));
        }
        let file = File::from(fd);
        let map = match Self::map(key, &file, len) {
            Ok(map) => map,
            Err(e) => {
                let _ = rustix::shm::shm_unlink(key);
                return Err(e);
            }
        };
        tracing::debug!(key, width = size.width, height = size.height, "created shm segment");
        Ok(Self {
            key: key.to_string(),
            size,
            file,
            map,
            owner: true,
        })
    }

    /// Attach to an existing segment created by someone else
    pub fn open(key: &str, size: Size) -> Result<Self, ShmError> {
        let len = segment_len(size)?;
        let fd = rustix::shm::shm_open(key, ShmOFlags::RDWR, Mode::empty()).map_err(|e| ShmError::Open {
            key: key.to_string(),
            source: e.into(),
        })?;
        let file = File::from(fd);
        let map = Self::map(key, &file, len)?;
        Ok(Self {
            key: key.to_string(),
            size,
            file,
            map,
            owner: false,
        })
    }

    pub fn attach(info: &ShmInfo) -> Result<Self, ShmError> {
        Self::open(&info.key, info.size())
    }

    fn map(key: &str, file: &File, len: usize) -> Result<MmapMut, ShmError> {
        // SAFETY: the segment is only written while holding the advisory lock,
        // and its length was fixed by ftruncate before mapping.
        unsafe { MmapOptions::new().len(len).map_mut(file) }.map_err(|source| ShmError::Map {
            key: key.to_string(),
            source,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn rect(&self) -> Rect {
        Rect::from_size(self.size)
    }

    pub fn info(&self) -> ShmInfo {
        ShmInfo {
            key: self.key.clone(),
            width: self.size.width,
            height: self.size.height,
            stride: self.size.width as usize * BYTES_PER_PIXEL,
            len: self.map.len(),
        }
    }

    /// Take the lock without blocking. Fails if anyone else holds it.
    pub fn try_lock(&mut self) -> Result<ShmGuard<'_>, ShmError> {
        rustix::fs::flock(&self.file, FlockOperation::NonBlockingLockExclusive)
            .map_err(|_| ShmError::Locked(self.key.clone()))?;
        Ok(ShmGuard { buffer: self })
    }

    /// Wait for the lock
    pub fn lock(&mut self) -> Result<ShmGuard<'_>, ShmError> {
        rustix::fs::flock(&self.file, FlockOperation::LockExclusive)
            .map_err(|_| ShmError::Locked(self.key.clone()))?;
        Ok(ShmGuard { buffer: self })
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = rustix::shm::shm_unlink(self.key.as_str()) {
                tracing::warn!(key = %self.key, error = %e, "failed to unlink shm segment");
            } else {
                tracing::debug!(key = %self.key, "released shm segment");
            }
        }
    }
}

/// Exclusive access to a segment's pixels. Unlocks on drop.
pub struct ShmGuard<'a> {
    buffer: &'a mut SharedBuffer,
}

impl ShmGuard<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.buffer.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.map
    }

    fn read_pixel(&self, x: i32, y: i32) -> u32 {
        let stride = self.buffer.size.width as usize * BYTES_PER_PIXEL;
        let off = y as usize * stride + x as usize * BYTES_PER_PIXEL;
        let mut px = [0u8; BYTES_PER_PIXEL];
        px.copy_from_slice(&self.buffer.map[off..off + BYTES_PER_PIXEL]);
        u32::from_ne_bytes(px)
    }

    /// Copy `rect` of the segment into the same rect of each target image.
    /// Returns the rect actually copied.
    pub fn copy_to(&self, rect: Rect, targets: &mut [&mut Image]) -> Rect {
        let mut area = rect.intersect(&self.buffer.rect());
        for target in targets.iter() {
            area = area.intersect(&target.rect());
        }
        if area.is_empty() {
            return Rect::default();
        }
        for y in area.y..area.bottom() {
            for x in area.x..area.right() {
                let px = self.read_pixel(x, y);
                for target in targets.iter_mut() {
                    target.set_pixel(x, y, px);
                }
            }
        }
        area
    }

    /// Write `image` into the segment with its top-left at the origin
    pub fn write_image(&mut self, image: &Image) {
        let area = image.rect().intersect(&self.buffer.rect());
        let stride = self.buffer.size.width as usize * BYTES_PER_PIXEL;
        for y in area.y..area.bottom() {
            for x in area.x..area.right() {
                let Some(px) = image.pixel(x, y) else { continue };
                let off = y as usize * stride + x as usize * BYTES_PER_PIXEL;
                self.buffer.map[off..off + BYTES_PER_PIXEL].copy_from_slice(&px.to_ne_bytes());
            }
        }
    }
}

impl Drop for ShmGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = rustix::fs::flock(&self.buffer.file, FlockOperation::Unlock) {
            tracing::warn!(key = %self.buffer.key, error = %e, "failed to unlock shm segment");
        }
    }
}

/// Segments handed out by one window, keyed by segment name
#[derive(Debug, Default)]
pub struct ShmPool {
    buffers: HashMap<String, SharedBuffer>,
}

impl ShmPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buffers.contains_key(key)
    }

    /// A segment of exactly `size`, reusing a pooled one when possible
    pub fn acquire(&mut self, size: Size) -> Result<ShmInfo, ShmError> {
        if let Some(existing) = self.buffers.values().find(|b| b.size() == size) {
            return Ok(existing.info());
        }
        let buffer = SharedBuffer::create(&next_key(), size)?;
        let info = buffer.info();
        self.buffers.insert(info.key.clone(), buffer);
        Ok(info)
    }

    pub fn release(&mut self, key: &str) -> Result<(), ShmError> {
        self.buffers
            .remove(key)
            .map(drop)
            .ok_or_else(|| ShmError::UnknownKey(key.to_string()))
    }

    /// Copy `rect` of segment `key` into `targets` under the segment lock.
    ///
    /// If the lock cannot be taken the segment is released and the call fails.
    pub fn copy_out(&mut self, key: &str, rect: Rect, targets: &mut [&mut Image]) -> Result<Rect, ShmError> {
        let buffer = self
            .buffers
            .get_mut(key)
            .ok_or_else(|| ShmError::UnknownKey(key.to_string()))?;
        let copied = buffer.try_lock().map(|guard| guard.copy_to(rect, targets));
        if copied.is_err() {
            tracing::warn!(key, "shm segment locked during put_image, releasing it");
            self.buffers.remove(key);
        }
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Color;

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            SharedBuffer::create(&next_key(), Size::new(0, 10)),
            Err(ShmError::InvalidSize(0, 10))
        ));
    }

    #[test]
    fn client_write_is_visible_to_owner() {
        let size = Size::new(4, 3);
        let mut owner = SharedBuffer::create(&next_key(), size).unwrap();
        let info = owner.info();
        assert_eq!(info.stride, 16);
        assert_eq!(info.len, 48);

        let mut client = SharedBuffer::attach(&info).unwrap();
        let red = Image::filled(size, Color::rgb(0xFF, 0, 0)).unwrap();
        client.lock().unwrap().write_image(&red);

        let mut out = Image::filled(size, Color::BLACK).unwrap();
        let copied = owner.try_lock().unwrap().copy_to(Rect::new(1, 1, 10, 10), &mut [&mut out]);
        assert_eq!(copied, Rect::new(1, 1, 3, 2));
        assert_eq!(out.pixel(1, 1), Some(Color::rgb(0xFF, 0, 0).to_argb()));
        assert_eq!(out.pixel(0, 0), Some(Color::BLACK.to_argb()));
    }

    #[test]
    fn try_lock_fails_while_other_side_holds_lock() {
        let size = Size::new(2, 2);
        let mut owner = SharedBuffer::create(&next_key(), size).unwrap();
        let mut client = SharedBuffer::attach(&owner.info()).unwrap();

        let guard = client.lock().unwrap();
        assert!(matches!(owner.try_lock(), Err(ShmError::Locked(_))));
        drop(guard);
        assert!(owner.try_lock().is_ok());
    }

    #[test]
    fn drop_unlinks_segment() {
        let key = next_key();
        let size = Size::new(2, 2);
        drop(SharedBuffer::create(&key, size).unwrap());
        assert!(matches!(SharedBuffer::open(&key, size), Err(ShmError::Open { .. })));
    }

    #[test]
    fn pool_reuses_matching_size() {
        let mut pool = ShmPool::new();
        let a = pool.acquire(Size::new(8, 8)).unwrap();
        let b = pool.acquire(Size::new(8, 8)).unwrap();
        assert_eq!(a.key, b.key);
        let c = pool.acquire(Size::new(4, 4)).unwrap();
        assert_ne!(a.key, c.key);
        assert_eq!(pool.len(), 2);

        pool.release(&a.key).unwrap();
        assert!(matches!(pool.release(&a.key), Err(ShmError::UnknownKey(_))));
    }

    #[test]
    fn pool_releases_segment_on_lock_failure() {
        let mut pool = ShmPool::new();
        let info = pool.acquire(Size::new(2, 2)).unwrap();
        let mut client = SharedBuffer::attach(&info).unwrap();
        let _guard = client.lock().unwrap();

        let mut out = Image::filled(Size::new(2, 2), Color::BLACK).unwrap();
        let result = pool.copy_out(&info.key, Rect::new(0, 0, 2, 2), &mut [&mut out]);
        assert!(matches!(result, Err(ShmError::Locked(_))));
        assert!(!pool.contains(&info.key));
    }
}
