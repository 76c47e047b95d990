//! The single, authoritative in-memory state of the orchestrator process.
//!
//! `OrchestratorState` is the C1 "state store": four concurrent registries
//! (agents, sandboxes, processes, pending correlations) wrapped in an `Arc`
//! and shared across every RPC handler, REST handler, and background task.
//! There is no global/static instance — it is constructed once in `main` and
//! injected everywhere it is needed.

use crate::cloud_provider::{CloudProvider, SandboxConfiguration};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

/// Status of a registered agent, mirrored 1:1 with `api::gen::api::v1::AgentStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentStatus {
    Starting,
    Ready,
    Busy,
    Unreachable,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub process_count: u32,
}

/// A live handle to one agent's `GetCommands` stream, plus a generation
/// counter used to detect whether a handler tearing down still owns the
/// currently-stored handle (it may have been replaced by a reconnect).
#[derive(Clone)]
pub struct DownstreamHandle {
    pub generation: u64,
    pub sender: tokio::sync::mpsc::Sender<Result<api::gen::api::v1::CommandRequest, tonic::Status>>,
}

struct AgentMutable {
    last_heartbeat: Instant,
    status: AgentStatus,
    resource_usage: Option<ResourceUsage>,
    downstream: Option<DownstreamHandle>,
}

/// Everything known about one registered agent.
///
/// `agent_id`, `sandbox_id`, `vm_id`, and `agent_version` are set once at
/// registration and never change for the lifetime of the record; mutable
/// fields live behind a single per-record lock so the record's address
/// stays stable once inserted into `OrchestratorState::agents`.
pub struct AgentRecord {
    pub agent_id: String,
    pub sandbox_id: String,
    pub vm_id: String,
    pub agent_version: String,
    pub metadata: HashMap<String, String>,
    mutable: RwLock<AgentMutable>,
}

impl AgentRecord {
    fn new(agent_id: String, sandbox_id: String, vm_id: String, agent_version: String, metadata: HashMap<String, String>) -> Self {
        Self {
            agent_id,
            sandbox_id,
            vm_id,
            agent_version,
            metadata,
            mutable: RwLock::new(AgentMutable {
                last_heartbeat: Instant::now(),
                status: AgentStatus::Ready,
                resource_usage: None,
                downstream: None,
            }),
        }
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.mutable.read().last_heartbeat
    }

    pub fn status(&self) -> AgentStatus {
        self.mutable.read().status
    }

    pub fn resource_usage(&self) -> Option<ResourceUsage> {
        self.mutable.read().resource_usage
    }

    pub fn is_stale(&self, stale_threshold: std::time::Duration) -> bool {
        self.last_heartbeat().elapsed() > stale_threshold
    }

    pub fn touch_heartbeat(&self, status: AgentStatus, resource_usage: Option<ResourceUsage>) {
        let mut m = self.mutable.write();
        m.last_heartbeat = Instant::now();
        m.status = status;
        if resource_usage.is_some() {
            m.resource_usage = resource_usage;
        }
    }

    pub fn mark_unreachable(&self) {
        self.mutable.write().status = AgentStatus::Unreachable;
    }

    /// Replaces the downstream stream handle, returning the new generation.
    pub fn set_downstream(&self, sender: tokio::sync::mpsc::Sender<Result<api::gen::api::v1::CommandRequest, tonic::Status>>, generation: u64) {
        let mut m = self.mutable.write();
        m.downstream = Some(DownstreamHandle { generation, sender });
    }

    /// Clears the downstream handle only if it is still the one identified
    /// by `generation` — prevents a departing handler from clobbering a
    /// handle installed by a subsequent reconnect.
    pub fn clear_downstream_if(&self, generation: u64) {
        let mut m = self.mutable.write();
        if matches!(&m.downstream, Some(h) if h.generation == generation) {
            m.downstream = None;
        }
    }

    pub fn downstream(&self) -> Option<DownstreamHandle> {
        self.mutable.read().downstream.clone()
    }

    pub fn has_downstream(&self) -> bool {
        self.mutable.read().downstream.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SandboxStatus {
    Creating,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Deleted,
    Error,
}

struct SandboxMutable {
    status: SandboxStatus,
    public_ip: Option<String>,
}

pub struct SandboxRecord {
    pub sandbox_id: String,
    pub configuration: SandboxConfiguration,
    pub vm_handle: String,
    pub created_at: DateTime<Utc>,
    mutable: RwLock<SandboxMutable>,
}

impl SandboxRecord {
    fn new(sandbox_id: String, configuration: SandboxConfiguration, vm_handle: String) -> Self {
        Self {
            sandbox_id,
            configuration,
            vm_handle,
            created_at: Utc::now(),
            mutable: RwLock::new(SandboxMutable {
                status: SandboxStatus::Creating,
                public_ip: None,
            }),
        }
    }

    pub fn status(&self) -> SandboxStatus {
        self.mutable.read().status
    }

    pub fn public_ip(&self) -> Option<String> {
        self.mutable.read().public_ip.clone()
    }

    pub fn set_status(&self, status: SandboxStatus) {
        self.mutable.write().status = status;
    }

    pub fn set_public_ip(&self, ip: Option<String>) {
        self.mutable.write().public_ip = ip;
    }
}

/// The terminal outcome of one dispatched command, as reported by
/// `SendCommandResult` or synthesized by the dispatcher on timeout/cancel.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
}

struct ProcessMutable {
    is_running: bool,
    result: Option<CommandOutcome>,
    log_lines: Vec<String>,
}

pub struct ProcessRecord {
    pub sandbox_id: String,
    pub process_id: String,
    pub command: String,
    pub created_at: DateTime<Utc>,
    mutable: RwLock<ProcessMutable>,
}

impl ProcessRecord {
    fn new(sandbox_id: String, process_id: String, command: String) -> Self {
        Self {
            sandbox_id,
            process_id,
            command,
            created_at: Utc::now(),
            mutable: RwLock::new(ProcessMutable {
                is_running: true,
                result: None,
                log_lines: Vec::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.mutable.read().is_running
    }

    pub fn result(&self) -> Option<CommandOutcome> {
        self.mutable.read().result.clone()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.mutable.read().log_lines.clone()
    }

    /// Completes the process exactly once. A second call after the first
    /// terminal transition is a no-op, matching the invariant that
    /// `is_running = false` state never changes once set.
    pub fn complete(&self, outcome: CommandOutcome) {
        let mut m = self.mutable.write();
        if !m.is_running {
            return;
        }
        m.is_running = false;
        m.result = Some(outcome);
    }

    pub fn push_log_line(&self, line: String) {
        let mut m = self.mutable.write();
        if m.is_running {
            m.log_lines.push(line);
        }
    }
}

/// A one-shot waiter registered by the dispatcher while a command is
/// in-flight. Removed from `OrchestratorState::pending` on completion,
/// timeout, or cancellation — whichever happens first and exactly once.
pub struct PendingCorrelation {
    pub sender: oneshot::Sender<CommandOutcome>,
}

/// Coalesces concurrent "no default image yet" creators onto a single
/// `CloudProvider::build_default_image` call.
pub struct DefaultImage {
    image_id: RwLock<Option<String>>,
    build_lock: AsyncMutex<()>,
}

impl DefaultImage {
    fn new() -> Self {
        Self {
            image_id: RwLock::new(None),
            build_lock: AsyncMutex::new(()),
        }
    }

    pub fn cached(&self) -> Option<String> {
        self.image_id.read().clone()
    }

    /// Returns the memoized default image id, building it at most once even
    /// under concurrent callers.
    pub async fn get_or_build(&self, cloud: &Arc<dyn CloudProvider>, orchestrator_endpoint: &str) -> anyhow::Result<String> {
        if let Some(id) = self.cached() {
            return Ok(id);
        }
        let _guard = self.build_lock.lock().await;
        if let Some(id) = self.cached() {
            return Ok(id);
        }
        let image_id = cloud.build_default_image(orchestrator_endpoint).await?;
        *self.image_id.write() = Some(image_id.clone());
        Ok(image_id)
    }
}

pub struct OrchestratorState {
    pub agents: DashMap<String, Arc<AgentRecord>>,
    pub sandboxes: DashMap<String, Arc<SandboxRecord>>,
    pub processes: DashMap<(String, String), Arc<ProcessRecord>>,
    /// Secondary index over `processes`, keyed by `process_id` alone, so a
    /// `SendLogs` message (which carries only `process_id`) can be routed to
    /// its record without scanning every running process.
    processes_by_id: DashMap<String, Arc<ProcessRecord>>,
    pub pending: DashMap<String, PendingCorrelation>,
    pub default_image: DefaultImage,
    pub cloud: Arc<dyn CloudProvider>,
    next_downstream_generation: AtomicU64,
}

impl OrchestratorState {
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Arc<Self> {
        Arc::new(Self {
            agents: DashMap::new(),
            sandboxes: DashMap::new(),
            processes: DashMap::new(),
            processes_by_id: DashMap::new(),
            pending: DashMap::new(),
            default_image: DefaultImage::new(),
            cloud,
            next_downstream_generation: AtomicU64::new(1),
        })
    }

    pub fn next_downstream_generation(&self) -> u64 {
        self.next_downstream_generation.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert_agent(&self, agent_id: String, sandbox_id: String, vm_id: String, agent_version: String, metadata: HashMap<String, String>) -> Arc<AgentRecord> {
        let record = Arc::new(AgentRecord::new(agent_id.clone(), sandbox_id, vm_id, agent_version, metadata));
        self.agents.insert(agent_id, record.clone());
        record
    }

    pub fn insert_sandbox(&self, sandbox_id: String, configuration: SandboxConfiguration, vm_handle: String) -> Arc<SandboxRecord> {
        let record = Arc::new(SandboxRecord::new(sandbox_id.clone(), configuration, vm_handle));
        self.sandboxes.insert(sandbox_id, record.clone());
        record
    }

    pub fn insert_process(&self, sandbox_id: String, process_id: String, command: String) -> Arc<ProcessRecord> {
        let record = Arc::new(ProcessRecord::new(sandbox_id.clone(), process_id.clone(), command));
        self.processes.insert((sandbox_id, process_id), record.clone());
        self.processes_by_id.insert(record.process_id.clone(), record.clone());
        record
    }

    /// Looks up a process by `process_id` alone, in O(1) — used by the
    /// `SendLogs` RPC handler, which only receives a `process_id`, not the
    /// owning `sandbox_id`.
    pub fn find_process_by_id(&self, process_id: &str) -> Option<Arc<ProcessRecord>> {
        self.processes_by_id.get(process_id).map(|e| e.value().clone())
    }
}
