//! IPC wire format
//!
//! Clients talk to the compositor over a Unix stream socket using
//! newline-delimited JSON. Every request carries a caller-chosen `id` that
//! the matching reply or error echoes; events pushed by the server carry
//! no id. Requests on one connection are answered in order.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{Color, Point, Rect};
use crate::input::InputEvent;
use crate::protocol::{ClientEvent, ClientId, SurfaceId};
use crate::window::WindowState;

/// Maximum IPC message size (1 MB)
pub const MAX_IPC_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum `draw_text` string size
pub const MAX_TEXT_SIZE: usize = 4096;

/// Maximum window title size
pub const MAX_TITLE_SIZE: usize = 1024;

/// Maximum shared memory key size
pub const MAX_SHM_KEY_SIZE: usize = 255;

/// Largest width or height accepted in a rect
pub const MAX_RECT_DIMENSION: i32 = 16384;

/// Largest absolute x or y accepted in a rect or point
pub const MAX_COORDINATE: i32 = MAX_RECT_DIMENSION * 2;

/// IPC errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// IO error during read/write
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parse error
    #[error("failed to parse JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Empty message received
    #[error("empty message received")]
    EmptyMessage,

    /// Message too large
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Validation error
    #[error("validation error: {0}")]
    ValidationError(String),
}

/// One request from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    pub id: u64,
    pub call: IpcCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum IpcCall {
    /// Reply: client id
    CreateClient,
    DestroyClient { client: ClientId },
    /// Answer to a `ping` event
    Pong { client: ClientId },
    /// Reply: surface id
    CreateSurface { client: ClientId },
    DestroySurface { surface: SurfaceId },
    /// Reply: rect
    Geometry { surface: SurfaceId },
    SetGeometry { surface: SurfaceId, rect: Rect },
    /// Reply: bool
    Visible { surface: SurfaceId },
    SetVisible { surface: SurfaceId, visible: bool },
    SetTitle { surface: SurfaceId, title: String },
    /// Reply: window state
    State { surface: SurfaceId },
    SetState { surface: SurfaceId, state: WindowState },
    /// Reply: false when a session is already open
    Begin { surface: SurfaceId },
    FillRect { surface: SurfaceId, rect: Rect, color: Color },
    /// `pos` is the baseline start
    DrawText {
        surface: SurfaceId,
        pos: Point,
        text: String,
        color: Color,
    },
    End { surface: SurfaceId },
    /// Reply: shm info
    GetShm { surface: SurfaceId },
    ReleaseShm { surface: SurfaceId, key: String },
    /// Reply: bool
    PutImage { surface: SurfaceId, key: String, rect: Rect },
    /// Debug only, gated by `allow_input_injection`
    InjectInput { event: InputEvent },
}

/// Message from compositor to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Reply {
        id: u64,
        value: serde_json::Value,
    },
    /// `id` is absent when the request could not be parsed
    Error {
        id: Option<u64>,
        message: String,
    },
    Event {
        client: ClientId,
        event: ClientEvent,
    },
}

impl ServerMessage {
    pub fn reply<T: Serialize>(id: u64, value: &T) -> Result<Self, IpcError> {
        Ok(ServerMessage::Reply {
            id,
            value: serde_json::to_value(value)?,
        })
    }

    pub fn error(id: Option<u64>, message: impl ToString) -> Self {
        ServerMessage::Error {
            id,
            message: message.to_string(),
        }
    }
}

fn validate_point(p: &Point) -> Result<(), IpcError> {
    if !(-MAX_COORDINATE..=MAX_COORDINATE).contains(&p.x) || !(-MAX_COORDINATE..=MAX_COORDINATE).contains(&p.y) {
        return Err(IpcError::ValidationError(format!(
            "position ({}, {}) out of range (-{MAX_COORDINATE}..={MAX_COORDINATE})",
            p.x, p.y
        )));
    }
    Ok(())
}

fn validate_rect(rect: &Rect) -> Result<(), IpcError> {
    validate_point(&rect.top_left())?;
    if rect.width < 0 || rect.height < 0 || rect.width > MAX_RECT_DIMENSION || rect.height > MAX_RECT_DIMENSION {
        return Err(IpcError::ValidationError(format!(
            "rect size {}x{} out of range (0..={})",
            rect.width, rect.height, MAX_RECT_DIMENSION
        )));
    }
    Ok(())
}

fn validate_len(what: &str, value: &str, max: usize) -> Result<(), IpcError> {
    if value.len() > max {
        return Err(IpcError::ValidationError(format!(
            "{what} too large: {} bytes (max {max})",
            value.len()
        )));
    }
    Ok(())
}

impl IpcRequest {
    /// Check limits serde cannot express
    pub fn validate(&self) -> Result<(), IpcError> {
        match &self.call {
            IpcCall::SetGeometry { rect, .. } | IpcCall::FillRect { rect, .. } | IpcCall::PutImage { rect, .. } => {
                validate_rect(rect)?
            }
            IpcCall::DrawText { text, pos, .. } => {
                validate_point(pos)?;
                validate_len("text", text, MAX_TEXT_SIZE)?
            }
            IpcCall::SetTitle { title, .. } => validate_len("title", title, MAX_TITLE_SIZE)?,
            _ => {}
        }
        match &self.call {
            IpcCall::ReleaseShm { key, .. } | IpcCall::PutImage { key, .. } => {
                validate_len("shm key", key, MAX_SHM_KEY_SIZE)?
            }
            _ => {}
        }
        Ok(())
    }
}

/// Parse and validate one request line
///
/// # Errors
///
/// Returns `IpcError::EmptyMessage` for a blank line.
/// Returns `IpcError::MessageTooLarge` if the line exceeds the size limit.
/// Returns `IpcError::ParseError` if JSON parsing fails.
/// Returns `IpcError::ValidationError` if a field is out of range.
pub fn parse_request(line: &str) -> Result<IpcRequest, IpcError> {
    if line.len() > MAX_IPC_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge {
            size: line.len(),
            max: MAX_IPC_MESSAGE_SIZE,
        });
    }
    let line = line.trim();
    if line.is_empty() {
        return Err(IpcError::EmptyMessage);
    }
    let request: IpcRequest = serde_json::from_str(line)?;
    request.validate()?;
    Ok(request)
}

/// Serialize a message as one line, newline included
pub fn encode<T: Serialize>(message: &T) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Splits a byte stream into lines
///
/// Bytes are buffered until a newline arrives. A partial line longer than
/// [`MAX_IPC_MESSAGE_SIZE`] is discarded and reported once.
#[derive(Debug, Default)]
pub struct LineReader {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete line without its newline
    pub fn next_line(&mut self) -> Option<Result<String, IpcError>> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(end) => {
                let line: Vec<u8> = self.buffer.drain(..=end).collect();
                if std::mem::take(&mut self.overflowed) {
                    // Tail of a line already reported as too large
                    return self.next_line();
                }
                let line = &line[..end];
                if line.len() > MAX_IPC_MESSAGE_SIZE {
                    return Some(Err(IpcError::MessageTooLarge {
                        size: line.len(),
                        max: MAX_IPC_MESSAGE_SIZE,
                    }));
                }
                Some(
                    String::from_utf8(line.to_vec())
                        .map_err(|e| IpcError::ValidationError(format!("message is not UTF-8: {e}"))),
                )
            }
            None if self.buffer.len() > MAX_IPC_MESSAGE_SIZE => {
                let size = self.buffer.len();
                self.buffer.clear();
                if std::mem::replace(&mut self.overflowed, true) {
                    return None;
                }
                Some(Err(IpcError::MessageTooLarge {
                    size,
                    max: MAX_IPC_MESSAGE_SIZE,
                }))
            }
            None => None,
        }
    }
}

/// IPC socket path.
///
/// Checks STONE_SOCKET first (for testing), then the configured path,
/// then the user's runtime directory.
pub fn socket_path(configured: Option<&Path>) -> PathBuf {
    if let Ok(path) = std::env::var("STONE_SOCKET") {
        return PathBuf::from(path);
    }
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("stone.sock");
    }
    let uid = rustix::process::getuid().as_raw();
    PathBuf::from(format!("/run/user/{}/stone.sock", uid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn parse_create_client() {
        let req = parse_request(r#"{"id":1,"call":{"method":"create_client"}}"#).unwrap();
        assert_eq!(
            req,
            IpcRequest {
                id: 1,
                call: IpcCall::CreateClient
            }
        );
    }

    #[test]
    fn parse_fill_rect_preserves_fields() {
        let msg = r#"{"id":7,"call":{"method":"fill_rect","surface":2,"rect":{"x":1,"y":2,"width":3,"height":4},"color":{"r":255,"g":0,"b":0}}}"#;
        match parse_request(msg).unwrap().call {
            IpcCall::FillRect { surface, rect, color } => {
                assert_eq!(surface, SurfaceId(2));
                assert_eq!(rect, Rect::new(1, 2, 3, 4));
                assert_eq!(color, Color::rgb(255, 0, 0));
            }
            other => panic!("expected FillRect, got {other:?}"),
        }
    }

    #[test]
    fn parse_inject_input() {
        let msg = r#"{"id":3,"call":{"method":"inject_input","event":{"type":"scroll","dx":0.0,"dy":1.0}}}"#;
        let req = parse_request(msg).unwrap();
        assert_eq!(
            req.call,
            IpcCall::InjectInput {
                event: InputEvent::Scroll { dx: 0.0, dy: 1.0 }
            }
        );
    }

    #[test]
    fn reject_empty_message() {
        assert!(matches!(parse_request("  \n"), Err(IpcError::EmptyMessage)));
    }

    #[test]
    fn reject_invalid_json() {
        assert!(matches!(parse_request("not json at all"), Err(IpcError::ParseError(_))));
    }

    #[test]
    fn reject_unknown_method() {
        assert!(matches!(
            parse_request(r#"{"id":1,"call":{"method":"explode"}}"#),
            Err(IpcError::ParseError(_))
        ));
    }

    #[test]
    fn reject_oversized_message() {
        let huge = "x".repeat(MAX_IPC_MESSAGE_SIZE + 1);
        assert!(matches!(parse_request(&huge), Err(IpcError::MessageTooLarge { .. })));
    }

    #[test]
    fn reject_text_too_large() {
        let text = "x".repeat(MAX_TEXT_SIZE + 1);
        let msg = format!(
            r#"{{"id":1,"call":{{"method":"draw_text","surface":1,"pos":{{"x":0,"y":0}},"text":"{text}","color":{{"r":0,"g":0,"b":0}}}}}}"#
        );
        assert!(matches!(parse_request(&msg), Err(IpcError::ValidationError(_))));
    }

    #[test]
    fn reject_negative_rect() {
        let msg = r#"{"id":1,"call":{"method":"set_geometry","surface":1,"rect":{"x":0,"y":0,"width":-5,"height":10}}}"#;
        assert!(matches!(parse_request(msg), Err(IpcError::ValidationError(_))));
    }

    #[test]
    fn reject_far_off_coordinates() {
        let far = i32::MAX - 5;
        let msg = format!(
            r#"{{"id":1,"call":{{"method":"fill_rect","surface":1,"rect":{{"x":{far},"y":0,"width":10,"height":10}},"color":{{"r":0,"g":0,"b":0}}}}}}"#
        );
        assert!(matches!(parse_request(&msg), Err(IpcError::ValidationError(_))));

        let msg = format!(
            r#"{{"id":2,"call":{{"method":"draw_text","surface":1,"pos":{{"x":0,"y":{}}},"text":"a","color":{{"r":0,"g":0,"b":0}}}}}}"#,
            i32::MIN
        );
        assert!(matches!(parse_request(&msg), Err(IpcError::ValidationError(_))));

        let edge = format!(
            r#"{{"id":3,"call":{{"method":"set_geometry","surface":1,"rect":{{"x":-{MAX_COORDINATE},"y":{MAX_COORDINATE},"width":1,"height":1}}}}}}"#
        );
        assert!(parse_request(&edge).is_ok());
    }

    #[test]
    fn server_message_wire_format() {
        let reply = ServerMessage::reply(4, &SurfaceId(9)).unwrap();
        assert_eq!(encode(&reply).unwrap(), "{\"kind\":\"reply\",\"id\":4,\"value\":9}\n");

        let event = ServerMessage::Event {
            client: ClientId(1),
            event: ClientEvent::Ping,
        };
        assert_eq!(
            encode(&event).unwrap(),
            "{\"kind\":\"event\",\"client\":1,\"event\":{\"type\":\"ping\"}}\n"
        );

        let error = ServerMessage::error(None, "bad");
        assert_eq!(encode(&error).unwrap(), "{\"kind\":\"error\",\"id\":null,\"message\":\"bad\"}\n");
    }

    #[test]
    fn line_reader_splits_partial_writes() {
        let mut reader = LineReader::new();
        reader.push(b"{\"a\":");
        assert!(reader.next_line().is_none());
        reader.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(reader.next_line().unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(reader.next_line().unwrap().unwrap(), "{\"b\":2}");
        assert!(reader.next_line().is_none());
        assert_eq!(reader.pending(), 4);
    }

    #[test]
    fn line_reader_reports_overflow_once() {
        let mut reader = LineReader::new();
        reader.push(&vec![b'x'; MAX_IPC_MESSAGE_SIZE + 1]);
        assert!(matches!(reader.next_line(), Some(Err(IpcError::MessageTooLarge { .. }))));
        reader.push(b"tail\n{\"ok\":1}\n");
        assert_eq!(reader.next_line().unwrap().unwrap(), "{\"ok\":1}");
    }

    #[test]
    fn encoded_lines_cross_a_socket() {
        let (mut client, server) = UnixStream::pair().expect("failed to create socket pair");
        let request = IpcRequest {
            id: 5,
            call: IpcCall::SetVisible {
                surface: SurfaceId(1),
                visible: true,
            },
        };
        client.write_all(encode(&request).unwrap().as_bytes()).unwrap();
        drop(client);

        let mut line = String::new();
        BufReader::new(server).read_line(&mut line).unwrap();
        assert_eq!(parse_request(&line).unwrap(), request);
    }

    #[test]
    fn socket_path_prefers_configured_path() {
        if std::env::var_os("STONE_SOCKET").is_some() {
            return;
        }
        let path = socket_path(Some(Path::new("/tmp/custom.sock")));
        assert_eq!(path, PathBuf::from("/tmp/custom.sock"));
    }
}
