//! Binds the core components to the agent transport endpoints

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::agent::AgentManager;
use crate::session::{DockerStreamManager, TerminalManager};
use crate::transport::ws::{
    ConnectionHandler, RpcRequest, RpcResponse, WsDockerChannel, WsShellStream, WsStateStream,
};

/// Connection handler wiring accepted streams to their managers
pub struct CoreServer {
    pub manager: Arc<AgentManager>,
    pub terminals: Arc<TerminalManager>,
    pub docker: Arc<DockerStreamManager>,
}

#[async_trait]
impl ConnectionHandler for CoreServer {
    async fn on_state_stream(&self, stream: WsStateStream) {
        self.manager.report_state(stream).await;
    }

    async fn on_shell_stream(&self, stream: WsShellStream) {
        if let Err(e) = self.terminals.handle_io_stream(stream).await {
            debug!("Shell stream rejected: {}", e);
        }
    }

    async fn on_docker_stream(&self, stream: WsDockerChannel) {
        if let Err(e) = self.docker.handle_stream(stream).await {
            debug!("Docker stream rejected: {}", e);
        }
    }

    async fn on_rpc(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Register(req) => RpcResponse::Register(self.manager.register(req).await),
            RpcRequest::Heartbeat { uuid } => {
                RpcResponse::Heartbeat(self.manager.heartbeat(uuid).await)
            }
            RpcRequest::ProbeResults { uuid, results } => {
                RpcResponse::ProbeResults(self.manager.report_probe_results(uuid, results).await)
            }
        }
    }
}
