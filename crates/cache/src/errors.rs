//! Error handling for the two-level feature cache
//!
//! Every error carries a recovery hint so callers can tell a fatal
//! desync apart from a degraded-but-recoverable I/O event.

mod conversions;
mod display;
mod recovery;
mod types;

pub use types::*;
