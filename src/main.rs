use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use outreach_engine::api::{self, AppState};
use outreach_engine::channels::{
    ChannelRegistry, EmailAdapter, NetworkAdapter, SessionPool, VoiceAdapter,
};
use outreach_engine::compose::SignatureComposer;
use outreach_engine::config::{AiConfig, EngineConfig, NetworkConfig, SmtpConfig, VoiceConfig};
use outreach_engine::engine::{EngineContext, Scheduler, SystemClock};
use outreach_engine::governor::RateGovernor;
use outreach_engine::personalize::{HttpAiClient, Personalizer};
use outreach_engine::store::LibSqlStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();

    let db_path = std::env::var("OUTREACH_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/outreach.db"));
    let store = Arc::new(LibSqlStore::new_local(&db_path).await?);

    // Channel adapters are enabled by the presence of their config.
    let mut registry = ChannelRegistry::new();
    let mut active_channels: Vec<&str> = Vec::new();

    if let Some(smtp) = SmtpConfig::from_env() {
        registry.register(Arc::new(EmailAdapter::new(smtp)));
        active_channels.push("email");
    }
    if let Some(voice) = VoiceConfig::from_env() {
        registry.register(Arc::new(VoiceAdapter::new(voice)));
        active_channels.push("call");
    }
    let sessions = NetworkConfig::from_env().map(|network| {
        let pool = Arc::new(SessionPool::new(network));
        registry.register(Arc::new(NetworkAdapter::connect(pool.clone())));
        registry.register(Arc::new(NetworkAdapter::message(pool.clone())));
        active_channels.push("network_connect");
        active_channels.push("network_message");
        pool
    });

    let ai = AiConfig::from_env().map(|ai| {
        Arc::new(HttpAiClient::new(&ai)) as Arc<dyn outreach_engine::personalize::AiClient>
    });
    if ai.is_none() {
        tracing::warn!("No AI key configured; AI personalization modes will degrade");
    }

    eprintln!("Outreach Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", db_path.display());
    eprintln!(
        "   Channels: {}",
        if active_channels.is_empty() {
            "none".to_string()
        } else {
            active_channels.join(", ")
        }
    );

    let ctx = Arc::new(EngineContext {
        config,
        store: store.clone(),
        clock: Arc::new(SystemClock),
        governor: Arc::new(RateGovernor::new(store.clone())),
        channels: Arc::new(registry),
        personalizer: Arc::new(Personalizer::new(ai)),
        composer: Arc::new(SignatureComposer::new()),
        sessions,
    });

    let scheduler = Arc::new(Scheduler::new(ctx.clone()));
    let shutdown = scheduler.shutdown_handle();
    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            if let Err(e) = scheduler.run().await {
                tracing::error!(error = %e, "Scheduler exited with error");
            }
        }
    });

    let bind_addr =
        std::env::var("OUTREACH_BIND").unwrap_or_else(|_| "127.0.0.1:7000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Control API listening");

    let app = api::router(AppState::new(ctx));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Stop claiming and drain in-flight work before exit.
    shutdown.store(true, Ordering::Relaxed);
    let _ = scheduler_task.await;

    Ok(())
}
