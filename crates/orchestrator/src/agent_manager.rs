//! C2: agent registration, heartbeat tracking, downstream stream bookkeeping,
//! and the liveness sweeper. Adapted from this codebase's `sim_orchestrator`
//! `AgentManager`, minus the local-process spawning (agents here run inside
//! cloud VMs and dial back in, rather than being spawned as child
//! processes).

use crate::state::{AgentRecord, AgentStatus, OrchestratorState, ResourceUsage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Creates or refreshes an agent record. Overwrite semantics: calling this
/// again for the same `agent_id` replaces the prior record (and therefore
/// drops any previous downstream handle reference), matching `Register`'s
/// idempotent-under-retry contract.
pub fn register(
    state: &Arc<OrchestratorState>,
    agent_id: String,
    sandbox_id: String,
    vm_id: String,
    agent_version: String,
    metadata: HashMap<String, String>,
) -> Arc<AgentRecord> {
    tracing::info!(agent_id = %agent_id, sandbox_id = %sandbox_id, vm_id = %vm_id, "Registering agent");
    state.insert_agent(agent_id, sandbox_id, vm_id, agent_version, metadata)
}

/// Refreshes `last_heartbeat`, status, and (if present) resource usage for
/// a known agent. Returns `false` if the agent is unknown, in which case
/// the caller must re-register.
pub fn heartbeat(
    state: &Arc<OrchestratorState>,
    agent_id: &str,
    status: AgentStatus,
    resource_usage: Option<ResourceUsage>,
) -> bool {
    match state.agents.get(agent_id) {
        Some(agent) => {
            agent.touch_heartbeat(status, resource_usage);
            true
        }
        None => {
            tracing::warn!(agent_id = %agent_id, "Heartbeat from unknown agent");
            false
        }
    }
}

/// Returns one ready-and-fresh agent whose `sandbox_id` matches, or `None`.
/// When more than one agent reports the same `sandbox_id`, the choice is
/// deterministic: the lexicographically smallest `agent_id`.
pub fn find_ready_agent(state: &Arc<OrchestratorState>, sandbox_id: &str, stale_threshold: Duration) -> Option<Arc<AgentRecord>> {
    let mut candidates: Vec<Arc<AgentRecord>> = state
        .agents
        .iter()
        .filter(|entry| {
            let agent = entry.value();
            agent.sandbox_id == sandbox_id
                && agent.status() == AgentStatus::Ready
                && !agent.is_stale(stale_threshold)
                && agent.has_downstream()
        })
        .map(|entry| entry.value().clone())
        .collect();

    candidates.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    candidates.into_iter().next()
}

/// Lists agents whose heartbeat is still fresh.
pub fn list_active(state: &Arc<OrchestratorState>, stale_threshold: Duration) -> Vec<Arc<AgentRecord>> {
    state
        .agents
        .iter()
        .filter(|entry| !entry.value().is_stale(stale_threshold))
        .map(|entry| entry.value().clone())
        .collect()
}

/// Background task: periodically marks stale agents `Unreachable`. It never
/// deletes a record — agents are only removed when their owning sandbox is
/// deleted (see `sandbox::delete_sandbox`).
pub async fn sweep_loop(state: Arc<OrchestratorState>, interval: Duration, stale_threshold: Duration, mut shutdown_rx: watch::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for entry in state.agents.iter() {
                    let agent = entry.value();
                    if agent.is_stale(stale_threshold) && agent.status() != AgentStatus::Unreachable {
                        tracing::warn!(agent_id = %agent.agent_id, "Agent is stale, marking unreachable");
                        agent.mark_unreachable();
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("Agent sweeper shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_provider::FakeCloudProvider;

    fn new_state() -> Arc<OrchestratorState> {
        OrchestratorState::new(FakeCloudProvider::new())
    }

    #[test]
    fn register_then_register_keeps_one_record_latest_heartbeat_wins() {
        let state = new_state();
        register(&state, "a1".into(), "s1".into(), "v1".into(), "1.0.0".into(), HashMap::new());
        let first_seen = state.agents.get("a1").unwrap().last_heartbeat();

        std::thread::sleep(Duration::from_millis(5));
        register(&state, "a1".into(), "s1".into(), "v2".into(), "1.0.1".into(), HashMap::new());

        assert_eq!(state.agents.len(), 1);
        let record = state.agents.get("a1").unwrap();
        assert!(record.last_heartbeat() >= first_seen);
        assert_eq!(record.agent_version, "1.0.1");
    }

    #[test]
    fn heartbeat_unknown_agent_returns_false() {
        let state = new_state();
        assert!(!heartbeat(&state, "ghost", AgentStatus::Ready, None));
    }

    #[test]
    fn find_ready_agent_requires_fresh_heartbeat_and_downstream() {
        let state = new_state();
        register(&state, "a1".into(), "s1".into(), "v1".into(), "1.0.0".into(), HashMap::new());

        // No downstream attached yet: not dispatchable.
        assert!(find_ready_agent(&state, "s1", Duration::from_secs(120)).is_none());
    }

    #[test]
    fn find_ready_agent_tie_break_is_deterministic_by_agent_id() {
        let state = new_state();
        for id in ["a2", "a1", "a3"] {
            let agent = register(&state, id.into(), "s1".into(), "v1".into(), "1.0.0".into(), HashMap::new());
            let (tx, _rx) = tokio::sync::mpsc::channel(1);
            agent.set_downstream(tx, state.next_downstream_generation());
        }
        let chosen = find_ready_agent(&state, "s1", Duration::from_secs(120)).unwrap();
        assert_eq!(chosen.agent_id, "a1");
    }
}
