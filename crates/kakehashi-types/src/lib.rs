//! Wire types for the kakehashi worker protocol.
//!
//! The worker speaks newline-delimited JSON over its stdin/stdout. Every line
//! is one self-describing message. This crate owns the shapes of those
//! messages and nothing else. It is a leaf crate with no internal
//! dependencies, shared by the kernel and the worker binary.
//!
//! # Message Overview
//!
//! ```text
//! host ──► worker                      worker ──► host
//! ─────────────────                    ─────────────────
//! {type: execute}        ─────────►    {type: response}
//! {action: execute}      ─────────►    {type: result}
//! {action: stats}        ─────────►    {type: stats}
//! {type|action: ping}    ─────────►    {type: pong}
//! {type|action: shutdown}─────────►    {type: shutdown}
//! {type: call-response}  ◄─────────    {type: call-request}
//!                                      {type: log} / {type: ready} / {type: error}
//! ```
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`Inbound`]       | Classified host → worker message             |
//! | [`Outbound`]      | Worker → host message                        |
//! | [`RequestId`]     | Caller-supplied correlation id (num or text) |
//! | [`SkillReport`]   | Outcome of one skill invocation              |
//! | [`StatsSnapshot`] | Aggregated skill execution statistics        |
//! |-------------------|----------------------------------------------|

pub mod protocol;
pub mod report;
pub mod stats;

pub use protocol::{
    CallResponse, ExecuteRequest, Inbound, Outbound, ProtocolError, RequestId, SkillRequest,
};
pub use report::{SkillErrorKind, SkillReport};
pub use stats::StatsSnapshot;
