//! C5: the process registry. Tracks per-`(sandbox_id, process_id)` state —
//! running flag, accumulated log lines, final result — layered directly on
//! top of the dispatcher's correlation map (`process_id == command_id`).

use crate::dispatcher;
use crate::error::OrchestratorError;
use crate::metrics::Metrics;
use crate::state::{CommandOutcome, OrchestratorState, ProcessRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Submits a command for execution and returns immediately with
/// `is_running = true`. The completion is driven in a detached task so the
/// caller isn't forced to await the full command lifetime; `get_status`
/// observes the result once it lands.
pub async fn submit_command(
    state: &Arc<OrchestratorState>,
    metrics: &Arc<Metrics>,
    sandbox_id: &str,
    command: String,
    timeout: Duration,
    stale_threshold: Duration,
) -> Result<Arc<ProcessRecord>, OrchestratorError> {
    let (command_id, rx) = dispatcher::dispatch(state, sandbox_id, command.clone(), timeout, None, HashMap::new(), stale_threshold).await?;

    let record = state.insert_process(sandbox_id.to_string(), command_id.clone(), command);

    let state_bg = state.clone();
    let record_bg = record.clone();
    let metrics_bg = metrics.clone();
    tokio::spawn(async move {
        let outcome = dispatcher::await_result(&state_bg, &command_id, rx, timeout, std::future::pending()).await;
        match outcome {
            Ok(result) => record_bg.complete(result),
            Err(OrchestratorError::Timeout) => {
                metrics_bg.commands_timed_out_total.inc();
                record_bg.complete(CommandOutcome {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: "timeout".to_string(),
                    duration_ms: timeout.as_millis() as u64,
                    success: false,
                })
            }
            Err(OrchestratorError::Cancelled) | Err(OrchestratorError::Shutdown) => {
                // Terminated via `terminate()` or process-wide shutdown; the
                // caller of that path is responsible for the record's final
                // state, so there is nothing further to record here.
            }
            Err(other) => {
                tracing::warn!(error = %other, "Command ended without a usable result");
            }
        }
    });

    Ok(record)
}

pub fn get_status(state: &Arc<OrchestratorState>, sandbox_id: &str, process_id: &str) -> Result<Arc<ProcessRecord>, OrchestratorError> {
    state
        .processes
        .get(&(sandbox_id.to_string(), process_id.to_string()))
        .map(|e| e.value().clone())
        .ok_or(OrchestratorError::NotFound)
}

pub fn get_logs(state: &Arc<OrchestratorState>, sandbox_id: &str, process_id: &str) -> Result<Vec<String>, OrchestratorError> {
    get_status(state, sandbox_id, process_id).map(|record| record.log_lines())
}

/// Sends a terminate signal to the agent over the sandbox's downstream
/// stream (best-effort — the agent may have already finished) and cancels
/// the pending waiter immediately on the orchestrator side.
pub async fn terminate(state: &Arc<OrchestratorState>, sandbox_id: &str, process_id: &str, stale_threshold: Duration) -> Result<(), OrchestratorError> {
    let record = get_status(state, sandbox_id, process_id)?;
    if !record.is_running() {
        return Ok(());
    }

    if let Some(agent) = crate::agent_manager::find_ready_agent(state, sandbox_id, stale_threshold) {
        if let Some(downstream) = agent.downstream() {
            let request = api::gen::api::v1::CommandRequest {
                command_id: uuid::Uuid::new_v4().to_string(),
                kind: api::gen::api::v1::CommandKind::Terminate as i32,
                command: String::new(),
                timeout_s: 0,
                working_dir: None,
                env: HashMap::new(),
                terminate_process_id: Some(process_id.to_string()),
            };
            let _ = downstream.sender.send(Ok(request)).await;
        }
    }

    // If cancel() finds nothing, the agent's real result already won the
    // race and is on its way through the background completion task — do
    // not clobber it with a synthetic outcome.
    if !dispatcher::cancel(state, process_id) {
        return Ok(());
    }
    record.complete(CommandOutcome {
        exit_code: -1,
        stdout: String::new(),
        stderr: "terminated".to_string(),
        duration_ms: 0,
        success: false,
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_provider::FakeCloudProvider;
    use crate::state::{AgentStatus, ResourceUsage};
    use api::gen::api::v1 as pb;

    fn new_state() -> Arc<OrchestratorState> {
        OrchestratorState::new(FakeCloudProvider::new())
    }

    async fn register_ready_agent(state: &Arc<OrchestratorState>, sandbox_id: &str) -> tokio::sync::mpsc::Receiver<Result<pb::CommandRequest, tonic::Status>> {
        let agent = state.insert_agent("a1".into(), sandbox_id.into(), "v1".into(), "1.0.0".into(), HashMap::new());
        agent.touch_heartbeat(AgentStatus::Ready, Some(ResourceUsage::default()));
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        agent.set_downstream(tx, state.next_downstream_generation());
        rx
    }

    #[tokio::test]
    async fn submit_then_status_reaches_completion() {
        let state = new_state();
        let mut rx = register_ready_agent(&state, "s1").await;

        let metrics = Arc::new(Metrics::new());
        let record = submit_command(&state, &metrics, "s1", "echo hi".into(), Duration::from_secs(5), Duration::from_secs(120)).await.unwrap();
        assert!(record.is_running());

        let sent = rx.recv().await.unwrap().unwrap();
        dispatcher::complete(
            &state,
            &sent.command_id,
            CommandOutcome { exit_code: 0, stdout: "hi\n".into(), stderr: String::new(), duration_ms: 5, success: true },
        );

        // Allow the background completion task to observe the result.
        for _ in 0..50 {
            if !get_status(&state, "s1", &record.process_id).unwrap().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = get_status(&state, "s1", &record.process_id).unwrap();
        assert!(!status.is_running());
        assert_eq!(status.result().unwrap().exit_code, 0);
    }

    #[tokio::test]
    async fn terminate_unknown_process_is_not_found() {
        let state = new_state();
        assert!(matches!(terminate(&state, "s1", "ghost", Duration::from_secs(120)).await, Err(OrchestratorError::NotFound)));
    }

    #[tokio::test]
    async fn logs_accumulate_only_while_running() {
        let state = new_state();
        register_ready_agent(&state, "s1").await;
        let record = state.insert_process("s1".into(), "c1".into(), "echo hi".into());
        record.push_log_line("line one".into());
        record.complete(CommandOutcome { exit_code: 0, stdout: String::new(), stderr: String::new(), duration_ms: 1, success: true });
        record.push_log_line("line two (dropped)".into());

        let logs = get_logs(&state, "s1", "c1").unwrap();
        assert_eq!(logs, vec!["line one".to_string()]);
    }
}
