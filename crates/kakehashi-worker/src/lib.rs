//! The kakehashi worker process.
//!
//! A host spawns `kakehashi-worker` and talks to it over stdin/stdout, one
//! JSON message per line. See `kakehashi-types` for the message shapes and
//! `kakehashi-kernel` for what the messages drive.

pub mod dispatcher;
pub mod transport;

pub use dispatcher::{ExitReason, READY_MESSAGE, SHUTDOWN_MESSAGE, Worker, serve};
