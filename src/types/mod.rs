//! Core types for aicli.

pub mod conversation;
pub mod message;
pub mod stream;

pub use conversation::*;
pub use message::*;
pub use stream::*;
