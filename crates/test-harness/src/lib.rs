//! Test harness for stone
//!
//! Provides infrastructure for testing the compositor without hardware.
//!
//! # Modules
//!
//! - `headless`: Real server over virtual outputs with a synthetic clock
//! - `live`: The full event loop on a socket, for client library tests
//! - `assertions`: Common test assertions
//! - `fixtures`: Test fixture helpers

pub mod assertions;
pub mod fixtures;
pub mod headless;
pub mod live;

pub use headless::{TestCompositor, TestError};
pub use live::LiveCompositor;
