use anyhow::Result;
use fleet_core::{
    api::ApiServer,
    config::Config,
    constants,
    events::{BusClient, EventBridge},
    executor::TaskExecutor,
    hosted::{AnthropicClient, HostedModel},
    locks::FileLockManager,
    queue::TaskAssigner,
    recovery::StuckTaskSweeper,
    resources::ResourcePool,
    review::ReviewGate,
    router::ComplexityRouter,
    runtime::{AgentRuntime, HttpAgentRuntime},
    store::{agents, Store},
    workspace::WorkspaceStore,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Starting Fleet Core orchestration control plane");

    let config = Config::load()?;
    let store = Store::connect(&config.database.url).await?;
    let roster = agents::ensure_roster(store.pool(), &config.roster).await?;
    info!("Agent roster ready with {} agents", roster.len());

    let events = EventBridge::new(BusClient::new(&config.bus));
    let locks = FileLockManager::new(store.clone());
    let resources = ResourcePool::new(&config.resources, config.router.complexity_threshold);
    let hosted: Option<Arc<dyn HostedModel>> = AnthropicClient::new(&config.hosted)
        .map(|client| Arc::new(client) as Arc<dyn HostedModel>);
    if hosted.is_none() {
        info!("No hosted API key configured; second opinions and reviews disabled");
    }

    let router = ComplexityRouter::new(store.clone(), hosted.clone(), config.router.clone());
    let assigner = Arc::new(TaskAssigner::new(
        store.clone(),
        locks.clone(),
        resources.clone(),
        router.clone(),
        events.clone(),
    ));
    let review = Arc::new(ReviewGate::new(
        store.clone(),
        events.clone(),
        hosted,
        config.review.clone(),
    ));
    let runtime: Arc<dyn AgentRuntime> = Arc::new(HttpAgentRuntime::new(&config.runtime));
    let workspace = WorkspaceStore::new(&config.workspace.dir);
    if let Err(e) = workspace
        .cleanup_old_outputs(constants::WORKSPACE_RETAIN_FILES)
        .await
    {
        warn!(error = %e, "workspace retention pass failed");
    }

    let executor = Arc::new(TaskExecutor::new(
        store.clone(),
        locks.clone(),
        resources.clone(),
        events.clone(),
        runtime,
        workspace.clone(),
        review.clone(),
        assigner.clone(),
        config.retry.clone(),
        config.runtime.clone(),
    ));

    let sweeper = StuckTaskSweeper::new(
        store.clone(),
        locks.clone(),
        resources.clone(),
        events.clone(),
        config.recovery.clone(),
    );

    let api_server = ApiServer::new(
        &config,
        store,
        assigner,
        executor,
        router,
        resources,
        locks,
        events,
        review,
        workspace,
    );

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!("API server failed: {}", e);
            }
        }
        _ = sweeper.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Fleet Core stopped");
    Ok(())
}
