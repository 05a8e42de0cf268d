//! The read loop: classify each inbound line and route it.
//!
//! Requests that may wait on the host (`execute` by `type` or by `action`)
//! run as tracked tasks so the loop keeps reading; the `call-response` that
//! unblocks them arrives through this same loop. Control messages are
//! answered inline.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use kakehashi_kernel::{
    CallbackGateway, ExecutionEngine, Outbox, RhaiEvaluator, Session, SkillExecutor, WorkerConfig,
};
use kakehashi_types::{ExecuteRequest, Inbound, Outbound, RequestId, SkillRequest};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::transport::{LineReader, spawn_writer};

pub const READY_MESSAGE: &str = "kakehashi worker ready";
pub const SHUTDOWN_MESSAGE: &str = "kakehashi worker shutting down";

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    EndOfStream,
    Shutdown,
}

enum Flow {
    Continue,
    Stop,
}

/// One worker: session, skills and the callback gateway behind a read loop.
pub struct Worker {
    config: WorkerConfig,
    outbox: Outbox,
    gateway: CallbackGateway,
    engine: Arc<ExecutionEngine>,
    skills: Arc<SkillExecutor>,
    tasks: TaskTracker,
}

impl Worker {
    pub fn new(config: WorkerConfig, outbox: Outbox) -> Self {
        let gateway = CallbackGateway::new(outbox.clone(), config.callback_timeout);
        let evaluator = RhaiEvaluator::new(Session::shared(), config.engine_limits())
            .with_gateway(gateway.clone());
        let engine = Arc::new(ExecutionEngine::new(Arc::new(evaluator), outbox.clone()));
        let skills =
            Arc::new(SkillExecutor::new(config.skill_settings()).with_gateway(gateway.clone()));

        Self {
            config,
            outbox,
            gateway,
            engine,
            skills,
            tasks: TaskTracker::new(),
        }
    }

    pub fn gateway(&self) -> &CallbackGateway {
        &self.gateway
    }

    pub fn skills(&self) -> &SkillExecutor {
        &self.skills
    }

    /// Announce readiness, then serve lines until EOF or `shutdown`.
    ///
    /// In-flight requests get the configured grace period to finish before
    /// this returns, whatever ended the loop.
    pub async fn run<R>(&self, reader: R) -> io::Result<ExitReason>
    where
        R: AsyncBufRead + Unpin,
    {
        self.outbox.send(Outbound::Ready {
            message: READY_MESSAGE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        info!(skills_root = %self.config.skills_root.display(), "worker ready");

        let result = self.read_loop(LineReader::new(reader)).await;
        self.finish().await;
        result
    }

    async fn read_loop<R>(&self, mut lines: LineReader<R>) -> io::Result<ExitReason>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            let Some(line) = lines.next_line().await? else {
                info!("input closed");
                return Ok(ExitReason::EndOfStream);
            };
            if line.trim().is_empty() {
                continue;
            }

            match Inbound::parse(&line) {
                Ok(message) => {
                    if let Flow::Stop = self.dispatch(message) {
                        return Ok(ExitReason::Shutdown);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "protocol error");
                    self.outbox
                        .send(Outbound::error(err.to_string(), err.request_id().cloned()));
                }
            }
        }
    }

    fn dispatch(&self, message: Inbound) -> Flow {
        match message {
            Inbound::Execute(request) => self.spawn_execute(request),
            Inbound::Skill(request) => self.spawn_skill(request),
            Inbound::CallResponse(response) => {
                self.gateway
                    .resolve(response.correlation_id, response.result, response.error);
            }
            Inbound::Stats { request_id } => self.send_stats(request_id),
            Inbound::ClearCache { request_id } => {
                self.skills.clear_cache();
                self.send_stats(request_id);
            }
            Inbound::Ping { request_id } => {
                self.outbox.send(Outbound::Pong { request_id });
            }
            Inbound::Shutdown { request_id } => {
                info!(request_id = ?request_id, "shutdown requested");
                self.outbox.send(Outbound::Shutdown {
                    message: SHUTDOWN_MESSAGE.to_string(),
                    request_id,
                });
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn spawn_execute(&self, request: ExecuteRequest) {
        let ExecuteRequest { id, code, context } = request;
        let engine = Arc::clone(&self.engine);
        let outbox = self.outbox.clone();
        let span = info_span!("dispatch.execute", id = %id);

        self.tasks.spawn(
            async move {
                let reply = match engine.execute(&code, context).await {
                    Ok(value) => Outbound::response_ok(id, value),
                    Err(err) => Outbound::response_err(id, err.to_string()),
                };
                outbox.send(reply);
            }
            .instrument(span),
        );
    }

    fn spawn_skill(&self, request: SkillRequest) {
        let SkillRequest {
            request_id,
            skill,
            params,
            timeout,
        } = request;
        let Some(name) = skill else {
            self.outbox
                .send(Outbound::error("missing 'skill' parameter", request_id));
            return;
        };
        let timeout = self.skill_timeout(timeout);
        let skills = Arc::clone(&self.skills);
        let outbox = self.outbox.clone();
        let span = info_span!("dispatch.skill", skill = %name, request_id = ?request_id);

        self.tasks.spawn(
            async move {
                let report = skills.run_skill(&name, params, timeout).await;
                outbox.send(Outbound::Result { request_id, report });
            }
            .instrument(span),
        );
    }

    fn skill_timeout(&self, requested: Option<f64>) -> Duration {
        match requested.map(Duration::try_from_secs_f64) {
            Some(Ok(timeout)) => timeout,
            Some(Err(err)) => {
                debug!(error = %err, "unusable skill timeout, using default");
                self.config.default_skill_timeout
            }
            None => self.config.default_skill_timeout,
        }
    }

    fn send_stats(&self, request_id: Option<RequestId>) {
        self.outbox.send(Outbound::Stats {
            request_id,
            stats: self.skills.stats(),
        });
    }

    async fn finish(&self) {
        self.gateway.cancel_all("transport closed");
        self.tasks.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tasks.len(),
                "in-flight requests abandoned at shutdown"
            );
        }
    }
}

/// Run a worker over a reader/writer pair until it exits.
///
/// Owns the writer task: every message queued before the worker stops is
/// written and flushed before this returns.
pub async fn serve<R, W>(config: WorkerConfig, reader: R, writer: W) -> anyhow::Result<ExitReason>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, rx) = Outbox::channel();
    let stop_writer = CancellationToken::new();
    let writer_task = spawn_writer(writer, rx, stop_writer.clone());

    let worker = Worker::new(config, outbox);
    let result = worker.run(reader).await;
    drop(worker);

    stop_writer.cancel();
    match writer_task.await {
        Ok(Ok(written)) => debug!(written, "writer drained"),
        Ok(Err(err)) => error!(error = %err, "output stream failed"),
        Err(err) => error!(error = %err, "writer task failed"),
    }

    Ok(result?)
}
