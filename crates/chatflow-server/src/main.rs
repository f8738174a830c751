//! Chatflow - messaging automation server entry point

mod webhook;

use anyhow::Result;
use chatflow_common::config::Config;
use chatflow_core::{
    CampaignDispatcher, ConnectionManager, EventProcessor, FlowEngine, HttpGatewayClient,
    JobRouter, JobScheduler,
};
use chatflow_storage::db::DatabasePool;
use chatflow_storage::repository::{
    AccountRepository, CampaignRepository, ConversationRepository, DbAccountRepository,
    DbCampaignRepository, DbConversationRepository, DbExecutionRepository, DbFlowRepository,
    DbMessageRepository, DbTargetRepository, ExecutionRepository, FlowRepository,
    MessageRepository, TargetRepository,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Chatflow server...");

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await?;

    // Repositories
    let accounts: Arc<dyn AccountRepository> =
        Arc::new(DbAccountRepository::new(db_pool.clone()));
    let conversations: Arc<dyn ConversationRepository> =
        Arc::new(DbConversationRepository::new(db_pool.clone()));
    let messages: Arc<dyn MessageRepository> =
        Arc::new(DbMessageRepository::new(db_pool.clone()));
    let flows: Arc<dyn FlowRepository> = Arc::new(DbFlowRepository::new(db_pool.clone()));
    let executions: Arc<dyn ExecutionRepository> =
        Arc::new(DbExecutionRepository::new(db_pool.clone()));
    let campaigns: Arc<dyn CampaignRepository> =
        Arc::new(DbCampaignRepository::new(db_pool.clone()));
    let targets: Arc<dyn TargetRepository> = Arc::new(DbTargetRepository::new(db_pool.clone()));

    // Gateway client and connection manager
    let gateway_client = Arc::new(HttpGatewayClient::new(&config.gateway)?);
    let connections = Arc::new(ConnectionManager::new(
        gateway_client,
        accounts.clone(),
        config.gateway.clone(),
    ));

    // Scheduler, flow engine, campaign dispatcher
    let scheduler = Arc::new(JobScheduler::new(
        flows.clone(),
        campaigns.clone(),
        executions.clone(),
    ));
    let engine = Arc::new(FlowEngine::new(
        flows.clone(),
        executions.clone(),
        conversations.clone(),
        messages.clone(),
        connections.clone(),
        scheduler.clone(),
        config.flow.clone(),
    ));
    let dispatcher = Arc::new(CampaignDispatcher::new(
        campaigns.clone(),
        targets.clone(),
        conversations.clone(),
        messages.clone(),
        connections.clone(),
        scheduler.clone(),
        config.campaign.clone(),
    ));

    // Reconciliation: every in-memory registry is rebuilt from the store
    connections.recover().await?;
    scheduler.initialize().await?;
    let failed_executions = engine.recover().await?;
    if failed_executions > 0 {
        info!(failed_executions, "Executions interrupted mid-step were marked for operator review");
    }
    dispatcher.recover().await?;

    // Scheduler loop
    let router = Arc::new(JobRouter::new(engine.clone(), dispatcher.clone()));
    let scheduler_handle = tokio::spawn(scheduler.clone().run(router));

    // Inbound event feed
    let (event_tx, event_rx) = mpsc::channel(1024);
    let processor = Arc::new(EventProcessor::new(
        conversations.clone(),
        messages.clone(),
        campaigns.clone(),
        targets.clone(),
        connections.clone(),
        engine.clone(),
    ));
    let processor_handle = tokio::spawn(processor.run(event_rx));

    // Webhook listener
    let webhook_handle = if config.webhook.enabled {
        let state = webhook::WebhookState::new(event_tx, config.webhook.secret.clone());
        let app = webhook::router(state);
        let bind = config.webhook.bind.clone();

        Some(tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(%bind, error = %e, "Failed to bind webhook listener");
                    return;
                }
            };
            info!(%bind, "Webhook listener started");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Webhook listener error");
            }
        }))
    } else {
        info!("Webhook listener disabled");
        None
    };

    info!("Chatflow server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.stop_all().await;
    scheduler_handle.abort();
    processor_handle.abort();
    if let Some(handle) = webhook_handle {
        handle.abort();
    }

    info!("Chatflow server shutdown complete");

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chatflow=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
