//! Stone compositor library
//!
//! A minimal scene-graph display server: windows are nodes in a z-ordered
//! tree, clients draw into them over a JSON socket protocol or shared
//! memory, and the composed frame is presented to one or more outputs.

pub mod compositor;
pub mod config;
pub mod cursor;
pub mod geometry;
pub mod image;
pub mod input;
pub mod ipc;
pub mod output;
pub mod protocol;
pub mod scene;
pub mod server;
pub mod setup;
pub mod shm;
pub mod text;
pub mod title_bar;
pub mod window;
