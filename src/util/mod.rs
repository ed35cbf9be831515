//! Retry policy, child process groups, and text truncation helpers.

pub mod process;
pub mod retry;
pub mod text;
