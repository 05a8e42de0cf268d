//! The `host` handle exposed to guest code.
//!
//! Guest code runs on a blocking thread, so a synchronous `host.invoke(..)`
//! parks that thread on the gateway's reply through the runtime handle while
//! the dispatcher keeps reading responses on the async side.

use std::sync::Arc;

use parking_lot::Mutex;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Position};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::gateway::{CallbackError, CallbackGateway, PendingReply};
use crate::value::{from_json, to_json};

/// Guest-visible bridge to the [`CallbackGateway`].
#[derive(Clone)]
pub struct HostBridge {
    gateway: CallbackGateway,
    runtime: Handle,
}

impl HostBridge {
    pub fn new(gateway: CallbackGateway, runtime: Handle) -> Self {
        Self { gateway, runtime }
    }

    /// Blocking call. Must run off the async worker threads.
    pub fn invoke(
        &self,
        target: &str,
        operation: &str,
        args: Array,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let args = args.iter().map(to_json).collect();
        let value = self
            .runtime
            .block_on(self.gateway.call(target, operation, args))
            .map_err(guest_error)?;
        from_json(&value)
    }

    /// Send the request now, wait later.
    pub fn invoke_async(
        &self,
        target: &str,
        operation: &str,
        args: Array,
    ) -> Result<Deferred, Box<EvalAltResult>> {
        let args = args.iter().map(to_json).collect();
        let reply = self
            .gateway
            .begin(target, operation, args)
            .map_err(guest_error)?;
        Ok(Deferred::new(reply, self.runtime.clone()))
    }
}

/// A host call whose answer has not been collected yet.
///
/// Clones share the same reply; only the first `wait` gets it.
#[derive(Clone)]
pub struct Deferred {
    correlation_id: u64,
    reply: Arc<Mutex<Option<PendingReply>>>,
    runtime: Handle,
}

impl Deferred {
    fn new(reply: PendingReply, runtime: Handle) -> Self {
        Self {
            correlation_id: reply.correlation_id(),
            reply: Arc::new(Mutex::new(Some(reply))),
            runtime,
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Await the host's answer from async code.
    pub async fn resolve(&self) -> Result<Value, CallbackError> {
        let reply = self.reply.lock().take();
        match reply {
            Some(reply) => reply.wait().await,
            None => Err(CallbackError::Cancelled {
                correlation_id: self.correlation_id,
                reason: "result already collected".into(),
            }),
        }
    }

    fn wait_blocking(&self) -> Result<Dynamic, Box<EvalAltResult>> {
        let value = self
            .runtime
            .block_on(self.resolve())
            .map_err(guest_error)?;
        from_json(&value)
    }
}

fn guest_error(err: CallbackError) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(err.to_string()), Position::NONE).into()
}

/// Register the `Host` and `Deferred` types and their methods.
///
/// Rhai treats `x.call(..)` as a function-pointer call, so the guest methods
/// are `invoke` and `invoke_async`.
pub fn register_host_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<HostBridge>("Host")
        .register_fn("invoke", |host: &mut HostBridge, target: &str, operation: &str| {
            host.invoke(target, operation, Array::new())
        })
        .register_fn(
            "invoke",
            |host: &mut HostBridge, target: &str, operation: &str, args: Array| {
                host.invoke(target, operation, args)
            },
        )
        .register_fn(
            "invoke_async",
            |host: &mut HostBridge, target: &str, operation: &str| {
                host.invoke_async(target, operation, Array::new())
            },
        )
        .register_fn(
            "invoke_async",
            |host: &mut HostBridge, target: &str, operation: &str, args: Array| {
                host.invoke_async(target, operation, args)
            },
        );

    engine
        .register_type_with_name::<Deferred>("Deferred")
        .register_fn("wait", |deferred: &mut Deferred| deferred.wait_blocking())
        .register_get("id", |deferred: &mut Deferred| {
            deferred.correlation_id() as rhai::INT
        });
}
