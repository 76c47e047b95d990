//! C4: sandbox registry and lifecycle. Maps `sandbox_id` to its VM handle,
//! configuration, and status, and issues create/delete through the
//! `CloudProvider` collaborator.

use crate::agent_manager;
use crate::cloud_provider::SandboxConfiguration;
use crate::dispatcher;
use crate::error::OrchestratorError;
use crate::metrics::Metrics;
use crate::state::{OrchestratorState, SandboxRecord, SandboxStatus};
use std::sync::Arc;
use std::time::Duration;

/// Provisions a new sandbox and returns immediately with `status = Creating`.
/// Provisioning itself runs in the background; synchronous failures (e.g.
/// the default image has never been built and the build call fails)
/// propagate to the caller, but once the record is inserted further failures
/// only change its status.
pub async fn create_sandbox(
    state: &Arc<OrchestratorState>,
    mut configuration: SandboxConfiguration,
    orchestrator_endpoint: &str,
) -> Result<Arc<SandboxRecord>, OrchestratorError> {
    if configuration.image_id.is_none() {
        let image_id = state
            .default_image
            .get_or_build(&state.cloud, orchestrator_endpoint)
            .await
            .map_err(|e| OrchestratorError::ProvisioningFailed(e.to_string()))?;
        configuration.image_id = Some(image_id);
    }

    let sandbox_id = uuid::Uuid::new_v4().to_string();

    let provisioned = state
        .cloud
        .create_sandbox(&sandbox_id, &configuration, orchestrator_endpoint)
        .await
        .map_err(|e| OrchestratorError::ProvisioningFailed(e.to_string()))?;

    let record = state.insert_sandbox(sandbox_id.clone(), configuration, provisioned.vm_handle);
    record.set_public_ip(provisioned.public_ip);

    tracing::info!(sandbox_id = %sandbox_id, "Sandbox created");
    Ok(record)
}

pub fn get_sandbox(state: &Arc<OrchestratorState>, sandbox_id: &str) -> Result<Arc<SandboxRecord>, OrchestratorError> {
    state.sandboxes.get(sandbox_id).map(|e| e.value().clone()).ok_or(OrchestratorError::NotFound)
}

pub fn list_sandboxes(state: &Arc<OrchestratorState>) -> Vec<Arc<SandboxRecord>> {
    state.sandboxes.iter().map(|e| e.value().clone()).collect()
}

/// `sandbox_id` is "ready" iff there exists a ready-and-fresh agent claiming
/// it — independent of the sandbox record's own status field, which tracks
/// provisioning rather than agent liveness.
pub fn is_sandbox_ready(state: &Arc<OrchestratorState>, sandbox_id: &str, stale_threshold: Duration) -> bool {
    agent_manager::find_ready_agent(state, sandbox_id, stale_threshold).is_some()
}

/// Accepts a deletion request and schedules it as a detached background
/// task: the sandbox transitions `Stopping` immediately, and `Deleted` or
/// `Error` once `CloudProvider::delete_sandbox` resolves. All pending
/// correlations and the agent record tied to this sandbox are cleaned up
/// once deletion is accepted, matching "delete-in-flight cancels pending
/// commands" from the design.
pub fn delete_sandbox(state: &Arc<OrchestratorState>, metrics: &Arc<Metrics>, sandbox_id: &str) -> Result<(), OrchestratorError> {
    let record = get_sandbox(state, sandbox_id)?;
    record.set_status(SandboxStatus::Stopping);

    let agent_ids: Vec<String> = state
        .agents
        .iter()
        .filter(|e| e.value().sandbox_id == sandbox_id)
        .map(|e| e.key().clone())
        .collect();

    let pending: Vec<Arc<crate::state::ProcessRecord>> = state
        .processes
        .iter()
        .filter(|e| e.key().0 == sandbox_id && e.value().is_running())
        .map(|e| e.value().clone())
        .collect();
    for process in pending {
        // If cancel() finds nothing, the agent's real result already won the
        // race and is on its way through the background completion task —
        // do not clobber it with a synthetic outcome.
        if !dispatcher::cancel(state, &process.process_id) {
            continue;
        }
        process.complete(crate::state::CommandOutcome {
            exit_code: -1,
            stdout: String::new(),
            stderr: "sandbox deleted".to_string(),
            duration_ms: 0,
            success: false,
        });
    }

    let state = state.clone();
    let metrics = metrics.clone();
    let sandbox_id = sandbox_id.to_string();
    tokio::spawn(async move {
        let vm_handle = record.vm_handle.clone();
        match state.cloud.delete_sandbox(&vm_handle).await {
            Ok(()) => {
                record.set_status(SandboxStatus::Deleted);
                for agent_id in agent_ids {
                    state.agents.remove(&agent_id);
                }
                metrics.update_active_agents(state.agents.len() as i64);
                let active = state.sandboxes.iter().filter(|e| e.value().status() != SandboxStatus::Deleted).count();
                metrics.update_active_sandboxes(active as i64);
                tracing::info!(sandbox_id = %sandbox_id, "Sandbox deleted");
            }
            Err(e) => {
                record.set_status(SandboxStatus::Error);
                tracing::error!(sandbox_id = %sandbox_id, error = %e, "Failed to delete sandbox");
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_provider::FakeCloudProvider;

    fn new_state() -> Arc<OrchestratorState> {
        OrchestratorState::new(FakeCloudProvider::new())
    }

    fn new_metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new())
    }

    #[tokio::test]
    async fn create_without_configuration_uses_default_image() {
        let state = new_state();
        let record = create_sandbox(&state, SandboxConfiguration::default(), "http://x").await.unwrap();
        assert_eq!(record.configuration.image_id.as_deref(), Some("fake-default-image"));
        assert_eq!(record.status(), SandboxStatus::Creating);
    }

    #[tokio::test]
    async fn get_unknown_sandbox_is_not_found() {
        let state = new_state();
        assert!(matches!(get_sandbox(&state, "ghost"), Err(OrchestratorError::NotFound)));
    }

    #[tokio::test]
    async fn delete_then_get_eventually_not_found_or_deleted() {
        let state = new_state();
        let record = create_sandbox(&state, SandboxConfiguration::default(), "http://x").await.unwrap();
        delete_sandbox(&state, &new_metrics(), &record.sandbox_id).unwrap();

        // Give the detached deletion task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fetched = get_sandbox(&state, &record.sandbox_id).unwrap();
        assert_eq!(fetched.status(), SandboxStatus::Deleted);
    }

    #[tokio::test]
    async fn delete_in_flight_completes_the_pending_process_as_terminated() {
        let state = new_state();
        let record = create_sandbox(&state, SandboxConfiguration::default(), "http://x").await.unwrap();
        let process = state.insert_process(record.sandbox_id.clone(), "c1".into(), "sleep 1000".into());
        state.pending.insert(
            "c1".into(),
            crate::state::PendingCorrelation { sender: tokio::sync::oneshot::channel().0 },
        );

        delete_sandbox(&state, &new_metrics(), &record.sandbox_id).unwrap();

        assert!(!process.is_running());
        assert_eq!(process.result().unwrap().exit_code, -1);
        assert!(state.pending.get("c1").is_none());
    }

    #[tokio::test]
    async fn concurrent_first_creates_coalesce_default_image_build() {
        let state = new_state();
        let a = create_sandbox(&state, SandboxConfiguration::default(), "http://x");
        let b = create_sandbox(&state, SandboxConfiguration::default(), "http://x");
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap().configuration.image_id, rb.unwrap().configuration.image_id);
    }
}
