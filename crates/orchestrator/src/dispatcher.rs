//! C3: the command dispatcher. Correlates an outbound `CommandRequest` with
//! its eventual result via a one-shot channel keyed by `command_id` — the
//! "futures keyed by id" rendezvous pattern. Never polls.

use crate::agent_manager;
use crate::error::OrchestratorError;
use crate::state::{CommandOutcome, OrchestratorState, PendingCorrelation};
use api::gen::api::v1 as pb;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Registers a pending correlation and writes a `CommandRequest` to the
/// resolved agent's downstream stream, returning immediately without
/// waiting for a result. Used by `process::submit_command`, which needs the
/// `command_id` before the command completes.
pub async fn dispatch(
    state: &Arc<OrchestratorState>,
    sandbox_id: &str,
    command: String,
    timeout: Duration,
    working_dir: Option<String>,
    env: HashMap<String, String>,
    stale_threshold: Duration,
) -> Result<(String, oneshot::Receiver<CommandOutcome>), OrchestratorError> {
    let agent = agent_manager::find_ready_agent(state, sandbox_id, stale_threshold).ok_or(OrchestratorError::NoReadyAgent)?;

    let command_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    state.pending.insert(command_id.clone(), PendingCorrelation { sender: tx });

    let downstream = match agent.downstream() {
        Some(d) => d,
        None => {
            state.pending.remove(&command_id);
            return Err(OrchestratorError::AgentDisconnected);
        }
    };

    let request = pb::CommandRequest {
        command_id: command_id.clone(),
        kind: pb::CommandKind::Exec as i32,
        command,
        timeout_s: timeout.as_secs() as u32,
        working_dir,
        env,
        terminate_process_id: None,
    };

    if downstream.sender.send(Ok(request)).await.is_err() {
        state.pending.remove(&command_id);
        return Err(OrchestratorError::AgentWriteFailed("downstream channel closed".into()));
    }

    tracing::info!(command_id = %command_id, sandbox_id = %sandbox_id, agent_id = %agent.agent_id, "Dispatched command");
    Ok((command_id, rx))
}

/// Dispatches a command and blocks until it completes, times out, or the
/// caller cancels — whichever comes first. This is the full `Execute`
/// algorithm from the design; `process::submit_command` instead calls
/// `dispatch` directly so it can return the `process_id` immediately.
pub async fn execute(
    state: &Arc<OrchestratorState>,
    sandbox_id: &str,
    command: String,
    timeout: Duration,
    cancel: impl std::future::Future<Output = ()>,
    stale_threshold: Duration,
) -> Result<CommandOutcome, OrchestratorError> {
    let (command_id, rx) = dispatch(state, sandbox_id, command, timeout, None, HashMap::new(), stale_threshold).await?;
    await_result(state, &command_id, rx, timeout, cancel).await
}

/// Waits on a previously registered pending correlation, bounded by
/// `timeout` and `cancel`. Always removes the pending entry before
/// returning, regardless of outcome.
pub async fn await_result(
    state: &Arc<OrchestratorState>,
    command_id: &str,
    rx: oneshot::Receiver<CommandOutcome>,
    timeout: Duration,
    cancel: impl std::future::Future<Output = ()>,
) -> Result<CommandOutcome, OrchestratorError> {
    tokio::select! {
        result = rx => {
            state.pending.remove(command_id);
            result.map_err(|_| OrchestratorError::Shutdown)
        }
        _ = tokio::time::sleep(timeout) => {
            state.pending.remove(command_id);
            tracing::warn!(command_id = %command_id, "Command timed out");
            Err(OrchestratorError::Timeout)
        }
        _ = cancel => {
            state.pending.remove(command_id);
            Err(OrchestratorError::Cancelled)
        }
    }
}

/// `SendCommandResult` lands here: completes the pending waiter if one is
/// still registered. A late result after the correlation has already been
/// removed (timeout, cancellation, or shutdown) is discarded — the RPC
/// still acks so the agent implementation stays simple.
pub fn complete(state: &Arc<OrchestratorState>, command_id: &str, outcome: CommandOutcome) {
    match state.pending.remove(command_id) {
        Some((_, pending)) => {
            let _ = pending.sender.send(outcome);
        }
        None => {
            tracing::debug!(command_id = %command_id, "Discarding late result for unknown or already-resolved command");
        }
    }
}

/// Cancels a single pending correlation immediately, used by
/// `process::terminate` and by sandbox deletion.
pub fn cancel(state: &Arc<OrchestratorState>, command_id: &str) -> bool {
    state.pending.remove(command_id).is_some()
}

/// Cancels every pending correlation, used on orchestrator shutdown. The
/// waiting `Execute` calls observe this as a dropped sender and translate it
/// to `OrchestratorError::Shutdown`.
pub fn cancel_all(state: &Arc<OrchestratorState>) {
    let ids: Vec<String> = state.pending.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        state.pending.remove(&id);
    }
}
