//! Conversation loop, its session state and the events it reports.

pub mod events;
pub mod runner;
pub mod session;

pub use events::*;
pub use runner::*;
pub use session::*;
