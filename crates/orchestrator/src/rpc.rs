//! C6: the agent-facing gRPC surface — `RegisterAgent`, `Heartbeat`,
//! `GetCommands` (server-stream), `SendCommandResult`, `SendLogs`
//! (client-stream). Adapted from this codebase's `sim_orchestrator::grpc`
//! service implementation.

use crate::config::Config;
use crate::dispatcher;
use crate::metrics::Metrics;
use crate::state::{AgentStatus as DomainAgentStatus, CommandOutcome, OrchestratorState, ResourceUsage as DomainResourceUsage};
use api::gen::api::v1::{
    agent_control_server::{AgentControl, AgentControlServer},
    *,
};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub struct AgentControlSvc {
    state: Arc<OrchestratorState>,
    metrics: Arc<Metrics>,
    config: Config,
}

fn pb_status_to_domain(status: i32) -> DomainAgentStatus {
    match AgentStatus::try_from(status).unwrap_or(AgentStatus::Unspecified) {
        AgentStatus::Starting => DomainAgentStatus::Starting,
        AgentStatus::Ready => DomainAgentStatus::Ready,
        AgentStatus::Busy => DomainAgentStatus::Busy,
        AgentStatus::Unreachable | AgentStatus::Unspecified => DomainAgentStatus::Unreachable,
    }
}

fn pb_resource_usage_to_domain(usage: Option<ResourceUsage>) -> Option<DomainResourceUsage> {
    usage.map(|u| DomainResourceUsage {
        cpu_percent: u.cpu_percent,
        memory_bytes: u.memory_bytes,
        disk_bytes: u.disk_bytes,
        process_count: u.process_count,
    })
}

#[tonic::async_trait]
impl AgentControl for AgentControlSvc {
    async fn register_agent(&self, req: Request<RegisterAgentRequest>) -> Result<Response<RegisterAgentResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let req = req.into_inner();

        crate::agent_manager::register(&self.state, req.agent_id, req.sandbox_id, req.vm_id, req.agent_version, req.metadata);
        self.metrics.agents_registered_total.inc();
        self.metrics.update_active_agents(self.state.agents.len() as i64);

        Ok(Response::new(RegisterAgentResponse {
            ok: true,
            message: "registered".to_string(),
            heartbeat_interval_s: self.config.heartbeat_interval.as_secs() as u32,
        }))
    }

    async fn heartbeat(&self, req: Request<HeartbeatRequest>) -> Result<Response<HeartbeatResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        self.metrics.heartbeats_total.inc();
        let req = req.into_inner();

        let status = pb_status_to_domain(req.status);
        let usage = pb_resource_usage_to_domain(req.resource_usage);
        let ok = crate::agent_manager::heartbeat(&self.state, &req.agent_id, status, usage);

        Ok(Response::new(HeartbeatResponse {
            ok,
            message: if ok { "ok".to_string() } else { "unknown_agent".to_string() },
        }))
    }

    type GetCommandsStream = Pin<Box<dyn Stream<Item = Result<CommandRequest, Status>> + Send + 'static>>;

    async fn get_commands(&self, req: Request<GetCommandsRequest>) -> Result<Response<Self::GetCommandsStream>, Status> {
        self.metrics.grpc_requests_total.inc();
        let req = req.into_inner();

        let agent = self.state.agents.get(&req.agent_id).map(|e| e.value().clone()).ok_or_else(|| Status::not_found("agent not registered"))?;

        let (tx, rx) = mpsc::channel(16);
        let generation = self.state.next_downstream_generation();
        let watchdog_tx = tx.clone();
        agent.set_downstream(tx, generation);
        tracing::info!(agent_id = %req.agent_id, sandbox_id = %req.sandbox_id, "Agent attached downstream command stream");

        let state = self.state.clone();
        let agent_id = req.agent_id.clone();
        tokio::spawn(async move {
            // Resolves once the client drops its end of the stream (closes
            // the connection or the receiver future is cancelled).
            watchdog_tx.closed().await;
            if let Some(current) = state.agents.get(&agent_id) {
                current.clear_downstream_if(generation);
                tracing::info!(agent_id = %agent_id, "Agent downstream command stream closed");
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::GetCommandsStream))
    }

    async fn send_command_result(&self, req: Request<CommandResultRequest>) -> Result<Response<CommandResultResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let req = req.into_inner();

        dispatcher::complete(
            &self.state,
            &req.command_id,
            CommandOutcome {
                exit_code: req.exit_code,
                stdout: req.stdout,
                stderr: req.stderr,
                duration_ms: req.duration_ms,
                success: req.success,
            },
        );
        self.metrics.commands_completed_total.inc();

        Ok(Response::new(CommandResultResponse { ok: true }))
    }

    async fn send_logs(&self, req: Request<Streaming<LogMessage>>) -> Result<Response<SendLogsResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let mut stream = req.into_inner();

        while let Some(msg) = stream.message().await? {
            match msg.process_id {
                Some(process_id) => match self.state.find_process_by_id(&process_id) {
                    Some(record) => record.push_log_line(msg.message),
                    None => tracing::debug!(agent_id = %msg.agent_id, process_id = %process_id, "Log line for unknown process, dropping"),
                },
                None => {
                    tracing::debug!(agent_id = %msg.agent_id, message = %msg.message, "Agent-wide log line");
                }
            }
        }

        Ok(Response::new(SendLogsResponse { ok: true }))
    }
}

pub async fn serve_grpc(state: Arc<OrchestratorState>, metrics: Arc<Metrics>, config: Config) -> anyhow::Result<()> {
    let addr = config.grpc_listen_addr;
    let svc = AgentControlSvc { state, metrics, config };

    tracing::info!(address = %addr, "Starting gRPC server");

    tonic::transport::Server::builder()
        .http2_keepalive_interval(Some(std::time::Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(std::time::Duration::from_secs(20)))
        .tcp_keepalive(Some(std::time::Duration::from_secs(30)))
        .add_service(AgentControlServer::new(svc))
        .serve(addr)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_provider::FakeCloudProvider;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_svc() -> AgentControlSvc {
        AgentControlSvc {
            state: OrchestratorState::new(FakeCloudProvider::new()),
            metrics: Arc::new(Metrics::new()),
            config: Config {
                rest_listen_addr: "0.0.0.0:0".parse().unwrap(),
                grpc_listen_addr: "0.0.0.0:0".parse().unwrap(),
                metrics_listen_addr: "0.0.0.0:0".parse().unwrap(),
                orchestrator_public_endpoint: "http://127.0.0.1:50051".to_string(),
                heartbeat_interval: Duration::from_secs(30),
                stale_threshold: Duration::from_secs(120),
                default_command_timeout: Duration::from_secs(300),
                sweep_interval: Duration::from_secs(30),
            },
        }
    }

    #[tokio::test]
    async fn register_returns_configured_heartbeat_interval() {
        let svc = test_svc();
        let resp = svc
            .register_agent(Request::new(RegisterAgentRequest {
                agent_id: "a1".into(),
                sandbox_id: "s1".into(),
                vm_id: "v1".into(),
                agent_version: "1.0.0".into(),
                metadata: HashMap::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.ok);
        assert_eq!(resp.heartbeat_interval_s, 30);
    }

    #[tokio::test]
    async fn heartbeat_before_register_is_unknown_agent() {
        let svc = test_svc();
        let resp = svc
            .heartbeat(Request::new(HeartbeatRequest { agent_id: "ghost".into(), status: AgentStatus::Ready as i32, resource_usage: None }))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.ok);
        assert_eq!(resp.message, "unknown_agent");
    }

    #[tokio::test]
    async fn get_commands_then_send_command_result_round_trips() {
        let svc = test_svc();
        svc.register_agent(Request::new(RegisterAgentRequest {
            agent_id: "a1".into(),
            sandbox_id: "s1".into(),
            vm_id: "v1".into(),
            agent_version: "1.0.0".into(),
            metadata: HashMap::new(),
        }))
        .await
        .unwrap();

        let mut stream = svc
            .get_commands(Request::new(GetCommandsRequest { agent_id: "a1".into(), sandbox_id: "s1".into() }))
            .await
            .unwrap()
            .into_inner();

        let state = svc.state.clone();
        let (command_id, mut rx) = dispatcher::dispatch(&state, "s1", "echo hi".into(), Duration::from_secs(5), None, HashMap::new(), Duration::from_secs(120))
            .await
            .unwrap();

        use futures::StreamExt;
        let sent = stream.next().await.unwrap().unwrap();
        assert_eq!(sent.command_id, command_id);

        svc.send_command_result(Request::new(CommandResultRequest {
            command_id: command_id.clone(),
            agent_id: "a1".into(),
            exit_code: 0,
            stdout: "hi\n".into(),
            stderr: String::new(),
            duration_ms: 3,
            success: true,
        }))
        .await
        .unwrap();

        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn send_logs_attaches_tagged_lines_and_drops_unknown() {
        let svc = test_svc();
        let process = svc.state.insert_process("s1".into(), "c1".into(), "echo hi".into());

        let messages = vec![
            LogMessage { agent_id: "a1".into(), level: LogLevel::Info as i32, message: "hello".into(), timestamp_ms: 0, process_id: Some("c1".into()) },
            LogMessage { agent_id: "a1".into(), level: LogLevel::Info as i32, message: "orphaned".into(), timestamp_ms: 0, process_id: Some("ghost".into()) },
        ];
        let stream = tokio_stream::iter(messages.into_iter().map(Ok));
        let resp = svc.send_logs(Request::new(stream)).await.unwrap().into_inner();

        assert!(resp.ok);
        assert_eq!(process.log_lines(), vec!["hello".to_string()]);
    }
}
