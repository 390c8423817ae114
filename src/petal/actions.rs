//! # Command-action framework (MQTT)
//!
//! Rust has no runtime method decoration, so "a petal method decorated as an
//! mqtt action" becomes a declarative list a petal returns from
//! `mqtt_actions()` -- spec §9's "replace with a registration pattern" flag,
//! taken as instruction rather than suggestion. This module folds every
//! loaded petal's list into one `"{petal-name}/{suffix}" → MqttAction` map
//! and registers a single master handler with the MQTT proxy (spec §4.7
//! steps 1-3).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, warn};

use crate::proxy::mqtt::{CommandHandler, IncomingCommand, MqttProxy};

use super::Petal;

/// Structured error codes surfaced to the admin UI (spec §4.7, §7).
#[derive(Clone, Debug, Error)]
pub enum ActionError {
    #[error("UNKNOWN_COMMAND: {0}")]
    UnknownCommand(String),
    #[error("VALIDATION_ERROR: {0}")]
    Validation(String),
    #[error("HANDLER_ERROR: {0}")]
    Handler(String),
    #[error("REBOOT_FAILED: {0}")]
    RebootFailed(String),
}

impl ActionError {
    fn code(&self) -> &'static str {
        match self {
            ActionError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            ActionError::Validation(_) => "VALIDATION_ERROR",
            ActionError::Handler(_) => "HANDLER_ERROR",
            ActionError::RebootFailed(_) => "REBOOT_FAILED",
        }
    }
}

pub type ActionHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ActionError>> + Send + Sync>;

/// One `{command_suffix, cpu_heavy, handler}` registration (spec §4.7).
#[derive(Clone)]
pub struct MqttAction {
    pub command_suffix: &'static str,
    pub cpu_heavy: bool,
    pub handler: ActionHandler,
}

const CPU_HEAVY_EXECUTOR_CAPACITY: usize = 64;
const CPU_HEAVY_WORKER_COUNT: usize = 2;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A small bounded pool of tokio tasks dedicated to `cpu_heavy` actions, so
/// they never starve the event loop or the inline (non-`cpu_heavy`) dispatch
/// path (spec §4.7, §5). `spawn_blocking` alone doesn't fit here because
/// handlers are async futures, not blocking closures -- see DESIGN.md.
#[derive(Clone)]
pub struct CpuHeavyExecutor {
    tx: mpsc::Sender<Job>,
}

impl CpuHeavyExecutor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(CPU_HEAVY_EXECUTOR_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..CPU_HEAVY_WORKER_COUNT {
            let rx = rx.clone();
            let name = format!("ActionExecutor-{worker_id}");
            let _ = tokio::task::Builder::new().name(&name).spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => job().await,
                        None => return,
                    }
                }
            });
        }
        Self { tx }
    }

    pub async fn spawn(&self, job: Job) {
        if self.tx.send(job).await.is_err() {
            error!("cpu-heavy action executor is gone, dropping job");
        }
    }
}

impl Default for CpuHeavyExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the master MQTT command handler for `petals` and registers it with
/// `mqtt_proxy` (spec §4.7 step 2). Returns the executor so the caller can
/// keep it alive for the process lifetime.
pub async fn install(mqtt_proxy: &Arc<MqttProxy>, petals: &[Arc<dyn Petal>]) -> CpuHeavyExecutor {
    let mut actions: HashMap<String, MqttAction> = HashMap::new();
    for petal in petals {
        for action in petal.mqtt_actions() {
            let key = format!("{}/{}", petal.name(), action.command_suffix);
            actions.insert(key, action);
        }
    }
    let actions = Arc::new(actions);
    let petal_locks: Arc<DashMap<String, Arc<Mutex<()>>>> = Arc::new(DashMap::new());
    let executor = CpuHeavyExecutor::new();

    let mqtt_for_handler = mqtt_proxy.clone();
    let executor_for_handler = executor.clone();
    let handler: CommandHandler = Arc::new(move |command: IncomingCommand| {
        let actions = actions.clone();
        let mqtt = mqtt_for_handler.clone();
        let executor = executor_for_handler.clone();
        let petal_locks = petal_locks.clone();
        tokio::spawn(async move {
            dispatch_one(actions, mqtt, executor, petal_locks, command).await;
        });
    });
    mqtt_proxy.register_handler(handler).await;
    executor
}

/// Resolves `actions.get(command)` and dispatches either inline or onto the
/// `cpu_heavy` executor. The organization-id guard (spec §4.7 step 2) runs
/// upstream of this function, in `MqttProxy`'s own dispatch loop, which
/// never invokes the registered handler at all before org/device ids are
/// known. Non-`cpu_heavy` invocations for the same petal are serialized
/// through `petal_locks` (spec §5: "MQTT command handlers for a single
/// petal are serialized unless flagged cpu_heavy").
async fn dispatch_one(
    actions: Arc<HashMap<String, MqttAction>>,
    mqtt: Arc<MqttProxy>,
    executor: CpuHeavyExecutor,
    petal_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    command: IncomingCommand,
) {
    let Some(action) = actions.get(&command.command).cloned() else {
        warn!("no MQTT action registered for command {}", command.command);
        if command.wait_response {
            respond_error(
                &mqtt,
                &command.message_id,
                &ActionError::UnknownCommand(command.command.clone()),
            )
            .await;
        }
        return;
    };

    let message_id = command.message_id.clone();
    let wait_response = command.wait_response;
    let data = command.data.clone();
    let handler = action.handler.clone();

    let result = if action.cpu_heavy {
        run_cpu_heavy(&executor, handler, data).await
    } else {
        let petal_name = command.command.split('/').next().unwrap_or(&command.command).to_string();
        let lock = petal_locks
            .entry(petal_name)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        handler(data).await
    };

    match result {
        Ok(fields) if wait_response => {
            mqtt.send_command_response(&message_id, ok_envelope(fields)).await;
        }
        Ok(_) => {}
        Err(e) if wait_response => {
            respond_error(&mqtt, &message_id, &e).await;
        }
        Err(e) => {
            warn!("MQTT action for {message_id} failed (no response requested): {e}");
        }
    }
}

async fn run_cpu_heavy(
    executor: &CpuHeavyExecutor,
    handler: ActionHandler,
    data: Value,
) -> Result<Value, ActionError> {
    let (tx, rx) = oneshot::channel();
    executor
        .spawn(Box::new(move || {
            Box::pin(async move {
                let result = handler(data).await;
                let _ = tx.send(result);
            })
        }))
        .await;
    rx.await
        .unwrap_or_else(|_| Err(ActionError::Handler("cpu-heavy executor dropped the job".to_string())))
}

fn ok_envelope(mut fields: Value) -> Value {
    if let Value::Object(ref mut map) = fields {
        map.entry("success").or_insert(Value::Bool(true));
    }
    fields
}

async fn respond_error(mqtt: &Arc<MqttProxy>, message_id: &str, error: &ActionError) {
    error!("MQTT action error for {message_id}: {error}");
    mqtt.send_command_response(
        message_id,
        serde_json::json!({
            "success": false,
            "error_code": error.code(),
            "message": error.to_string(),
        }),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_spec_taxonomy() {
        assert_eq!(ActionError::UnknownCommand("x".into()).code(), "UNKNOWN_COMMAND");
        assert_eq!(ActionError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(ActionError::Handler("x".into()).code(), "HANDLER_ERROR");
        assert_eq!(ActionError::RebootFailed("x".into()).code(), "REBOOT_FAILED");
    }

    #[test]
    fn ok_envelope_injects_success_when_absent() {
        let fields = ok_envelope(serde_json::json!({"status": "done"}));
        assert_eq!(fields["success"], true);
        assert_eq!(fields["status"], "done");
    }

    #[test]
    fn ok_envelope_preserves_explicit_success() {
        let fields = ok_envelope(serde_json::json!({"success": false}));
        assert_eq!(fields["success"], false);
    }
}
