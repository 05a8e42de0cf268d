//! Guest code evaluation against the persistent [`Session`](crate::session::Session).
//!
//! Code that compiles as a single expression is evaluated and nothing is
//! persisted. Anything else runs as statements and every variable it bound or
//! changed (except the reserved per-call names) is merged back into the
//! session. The session lock is only held to take the snapshot and to merge,
//! never while guest code runs or waits on the host.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use rhai::{AST, Dynamic, Engine, EvalAltResult};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use crate::engine::{CapturedOutput, EngineLimits, GuestFailure, OutputCapture, build_engine};
use crate::gateway::{CallbackError, CallbackGateway};
use crate::host::{Deferred, HostBridge};
use crate::outbox::Outbox;
use crate::session::{CONTEXT_VAR, HOST_VAR, RESULT_VAR, SharedSession};
use crate::value::{from_json, to_json};

/// Why an `execute` request produced no value.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("compile error: {0}")]
    Compile(GuestFailure),

    #[error("{0}")]
    Runtime(GuestFailure),

    #[error("host call failed: {0}")]
    Callback(#[from] CallbackError),

    #[error("invalid context value: {0}")]
    Context(String),

    #[error("evaluation task failed: {0}")]
    Join(String),
}

/// Result plus whatever the guest printed along the way.
#[derive(Debug)]
pub struct Evaluation {
    pub result: Result<Value, ExecutionError>,
    pub output: CapturedOutput,
}

/// Something that can evaluate guest code in a persistent session.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, code: &str, context: Map<String, Value>) -> Evaluation;
}

enum Produced {
    Ready(Value),
    Deferred(Deferred),
}

/// [`Evaluator`] backed by Rhai.
pub struct RhaiEvaluator {
    session: SharedSession,
    limits: EngineLimits,
    gateway: Option<CallbackGateway>,
}

impl RhaiEvaluator {
    pub fn new(session: SharedSession, limits: EngineLimits) -> Self {
        Self {
            session,
            limits,
            gateway: None,
        }
    }

    /// Expose `host` to guest code through this gateway.
    pub fn with_gateway(mut self, gateway: CallbackGateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }
}

#[async_trait]
impl Evaluator for RhaiEvaluator {
    fn name(&self) -> &str {
        "rhai"
    }

    async fn evaluate(&self, code: &str, context: Map<String, Value>) -> Evaluation {
        let session = Arc::clone(&self.session);
        let limits = self.limits.clone();
        let host = self
            .gateway
            .clone()
            .map(|gateway| HostBridge::new(gateway, Handle::current()));
        let code = code.to_string();
        let capture = OutputCapture::default();
        let task_capture = capture.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let interrupted = Arc::new(AtomicBool::new(false));
            let engine = build_engine(&limits, &task_capture, interrupted);
            run_in_session(&engine, &session, &code, context, host)
        })
        .await;

        let result = match joined {
            Ok(Ok(Produced::Ready(value))) => Ok(value),
            Ok(Ok(Produced::Deferred(deferred))) => {
                debug!(correlation_id = deferred.correlation_id(), "awaiting deferred result");
                deferred.resolve().await.map_err(ExecutionError::from)
            }
            Ok(Err(err)) => Err(err),
            Err(err) => Err(ExecutionError::Join(err.to_string())),
        };

        Evaluation {
            result,
            output: capture.take(),
        }
    }
}

fn run_in_session(
    engine: &Engine,
    session: &SharedSession,
    code: &str,
    context: Map<String, Value>,
    host: Option<HostBridge>,
) -> Result<Produced, ExecutionError> {
    let base = session.lock().snapshot();
    let mut scope = base.scope();
    for (name, value) in &context {
        scope.push_dynamic(name.clone(), from_json(value).map_err(context_error)?);
    }
    let context = from_json(&Value::Object(context)).map_err(context_error)?;
    scope.push_dynamic(CONTEXT_VAR, context);
    if let Some(host) = host {
        scope.push(HOST_VAR, host);
    }

    if let Ok(expr) = engine.compile_expression_with_scope(&scope, code) {
        let ast = base.functions().merge(&expr);
        let value = engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(runtime_error)?;
        return Ok(produced(value));
    }

    let script = engine
        .compile_with_scope(&scope, code)
        .map_err(|err| {
            let err: Box<EvalAltResult> = err.into();
            ExecutionError::Compile(GuestFailure::from_eval(&err))
        })?;
    let ast: AST = base.functions().merge(&script);
    let value = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(runtime_error)?;

    {
        let mut session = session.lock();
        let written = session.merge(&base, &scope);
        session.absorb_functions(&script);
        debug!(written, "session updated");
    }

    if !value.is_unit() {
        return Ok(produced(value));
    }
    match scope.get_value::<Dynamic>(RESULT_VAR) {
        Some(value) => Ok(produced(value)),
        None => Ok(Produced::Ready(Value::Null)),
    }
}

fn produced(value: Dynamic) -> Produced {
    if value.is::<Deferred>() {
        Produced::Deferred(value.cast::<Deferred>())
    } else {
        Produced::Ready(to_json(&value))
    }
}

fn runtime_error(err: Box<EvalAltResult>) -> ExecutionError {
    ExecutionError::Runtime(GuestFailure::from_eval(&err))
}

fn context_error(err: Box<EvalAltResult>) -> ExecutionError {
    ExecutionError::Context(err.to_string())
}

/// The execution component: evaluates and forwards captured output as logs.
pub struct ExecutionEngine {
    evaluator: Arc<dyn Evaluator>,
    outbox: Outbox,
}

impl ExecutionEngine {
    pub fn new(evaluator: Arc<dyn Evaluator>, outbox: Outbox) -> Self {
        Self { evaluator, outbox }
    }

    #[instrument(skip_all, name = "engine.execute", fields(evaluator = self.evaluator.name(), code_len = code.len()))]
    pub async fn execute(
        &self,
        code: &str,
        context: Map<String, Value>,
    ) -> Result<Value, ExecutionError> {
        let Evaluation { result, output } = self.evaluator.evaluate(code, context).await;
        for line in output.log_lines() {
            self.outbox.log(line);
        }
        if let Err(err) = &result {
            debug!(error = %err, "execution failed");
        }
        result
    }
}
