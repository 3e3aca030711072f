use anyhow::Result;
use std::env;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fleetwatch::agent::{AgentManager, ClientRegistry};
use fleetwatch::alert::{AlertEngine, ExpiryScheduler, LogAlertEngine};
use fleetwatch::audit::AuditLogger;
use fleetwatch::config::Config;
use fleetwatch::initialize_logging;
use fleetwatch::probe::{ProbeExecutor, ProbeScheduler};
use fleetwatch::repository::memory::{
    MemoryAuditRepository, MemoryHostRepository, MemoryServiceRepository,
};
use fleetwatch::repository::{AuditEventRepository, HostRepository, ServiceRepository};
use fleetwatch::sentinel::ServiceSentinel;
use fleetwatch::server::CoreServer;
use fleetwatch::service::{HostService, ServiceProbeService};
use fleetwatch::session::{DockerStreamManager, TerminalManager};
use fleetwatch::state::StateCollector;
use fleetwatch::transport::ws;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.contains(&"--version".to_string()) || args.contains(&"-V".to_string()) {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }

    initialize_logging()?;
    let config = Config::load().await?;
    info!("Starting fleetwatch control plane");

    // The relational repositories and the delivery-capable alert engine
    // are provided by the outer layers; the in-memory implementations
    // keep the core self-contained.
    let hosts: Arc<dyn HostRepository> = Arc::new(MemoryHostRepository::new());
    let services: Arc<dyn ServiceRepository> = Arc::new(MemoryServiceRepository::new());
    let audit_repo: Arc<dyn AuditEventRepository> = Arc::new(MemoryAuditRepository::new());
    let alerts: Arc<dyn AlertEngine> = Arc::new(LogAlertEngine::new());

    let root = CancellationToken::new();

    let registry = ClientRegistry::new(Arc::clone(&hosts), config.agent.clone());
    let collector = StateCollector::new(Arc::clone(&hosts), config.collector.clone());
    collector.set_registry(Arc::clone(&registry));
    collector.start_janitor(root.child_token());

    let sentinel = ServiceSentinel::new(
        Arc::clone(&services),
        Arc::clone(&alerts),
        config.sentinel.clone(),
    );
    sentinel.reload_from_history().await?;
    sentinel.start(root.child_token());

    let manager = AgentManager::new(
        Arc::clone(&registry),
        Arc::clone(&hosts),
        Arc::clone(&collector),
        Arc::clone(&sentinel),
    );

    let executor = ProbeExecutor::new(config.probe.clone())?;
    let scheduler = ProbeScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&hosts),
        Arc::clone(&services),
        Arc::clone(&sentinel),
        Arc::clone(&alerts),
        executor,
    );
    scheduler.schedule_all().await?;

    let terminals = TerminalManager::new(config.session.clone());
    let docker = DockerStreamManager::new(
        Arc::clone(&registry),
        Arc::clone(&hosts),
        config.session.clone(),
    );
    let audit = AuditLogger::new(audit_repo, config.audit.clone(), root.child_token());

    let expiry = ExpiryScheduler::new(Arc::clone(&hosts), Arc::clone(&alerts));
    expiry.start(root.child_token());

    // Mounted by the REST layer
    let _host_service = HostService::new(
        Arc::clone(&hosts),
        Arc::clone(&registry),
        Arc::clone(&collector),
        Arc::clone(&terminals),
        Arc::clone(&docker),
        Arc::clone(&audit),
        config.server.public_url.clone(),
    );
    let _probe_service = ServiceProbeService::new(
        Arc::clone(&services),
        Arc::clone(&scheduler),
        Arc::clone(&sentinel),
        Arc::clone(&audit),
    );

    let handler = Arc::new(CoreServer {
        manager,
        terminals,
        docker,
    });
    let bind_addr = config.server.bind_addr.clone();
    let serve_cancel = root.child_token();
    let serve_task =
        tokio::spawn(async move { ws::serve(&bind_addr, handler, serve_cancel).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    root.cancel();
    scheduler.shutdown();
    sentinel.shutdown().await;
    let _ = serve_task.await;

    info!("Fleetwatch stopped");
    Ok(())
}
