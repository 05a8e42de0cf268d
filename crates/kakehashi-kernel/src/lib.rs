//! Execution core of the kakehashi worker.
//!
//! # Components
//!
//! |------------------------|-------------------------------------------------|
//! | Type                   | Purpose                                         |
//! |------------------------|-------------------------------------------------|
//! | [`Outbox`]             | Cloneable sender onto the outbound line stream  |
//! | [`CallbackGateway`]    | Correlated guest → host calls                   |
//! | [`Session`]            | Globals and functions that persist across runs  |
//! | [`RhaiEvaluator`]      | [`Evaluator`] running Rhai against the session  |
//! | [`ExecutionEngine`]    | Evaluate, then forward captured output as logs  |
//! | [`SkillExecutor`]      | Skill resolve / load / cache / run / stats      |
//! | [`WorkerConfig`]       | Settings, optionally from a `worker.rhai`       |
//! |------------------------|-------------------------------------------------|
//!
//! Guest code always runs on a `spawn_blocking` thread. A guest that calls
//! `host.invoke(..)` parks that thread on the gateway until the dispatcher
//! routes the matching `call-response` back in.

pub mod config;
pub mod engine;
pub mod evaluator;
pub mod gateway;
pub mod host;
pub mod outbox;
pub mod session;
pub mod skills;
pub mod value;

pub use config::{ConfigError, WorkerConfig, load_worker_config, load_worker_config_file};
pub use engine::{CapturedOutput, EngineLimits, GuestFailure};
pub use evaluator::{Evaluation, Evaluator, ExecutionEngine, ExecutionError, RhaiEvaluator};
pub use gateway::{CallbackError, CallbackGateway, PendingReply};
pub use host::{Deferred, HostBridge};
pub use outbox::Outbox;
pub use session::{Session, SessionSnapshot, SharedSession};
pub use skills::{SkillError, SkillExecutor, SkillLoader, SkillSettings};
