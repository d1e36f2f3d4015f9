//! Compute DEX Trading Core - Main Entry Point

use compute_dex_core::api::{self, ApiState};
use compute_dex_core::config::{CoreConfig, FALLBACK_PROVIDER_ID};
use compute_dex_core::monitor::{HttpProbe, ProviderMonitor};
use compute_dex_core::router::{ClusterRouter, HttpInferenceTransport, RouterConfig};
use compute_dex_core::selector::{ProviderSelector, SelectionStrategy};
use compute_dex_core::types::ProviderId;
use compute_dex_core::{EventHub, InferenceTransport, MatchingEngine, ProviderRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🚀 Starting Compute DEX Trading Core");

    let config = CoreConfig::from_env();

    // Engine and event fan-out
    let events = EventHub::default();
    let engine = Arc::new(MatchingEngine::new(events.clone()));

    // Provider registry, seeded from configuration
    let registry = Arc::new(ProviderRegistry::new(config.monitor.offline_threshold));
    for descriptor in config.seed_descriptors() {
        registry.upsert(descriptor)?;
    }
    tracing::info!(
        "📡 Seeded {} provider(s), fallback {}",
        config.provider_urls.len(),
        if config.fallback.is_some() { "enabled" } else { "disabled" }
    );

    // Inference routing
    let selector = Arc::new(ProviderSelector::new());
    let mut transport = HttpInferenceTransport::new(config.router.request_timeout);
    let mut fallback_provider = None;
    if let Some(fallback) = &config.fallback {
        let id = ProviderId::new(FALLBACK_PROVIDER_ID);
        transport = transport.with_credential(id.clone(), fallback.api_key.clone());
        fallback_provider = Some(id);
    }
    let transport: Arc<dyn InferenceTransport> = Arc::new(transport);
    let router = Arc::new(ClusterRouter::new(
        registry.clone(),
        selector,
        transport,
        RouterConfig {
            max_retries: config.router.max_retries,
            min_reputation: config.router.min_reputation,
            strategy: SelectionStrategy::default(),
            fallback_provider,
        },
    ));

    // Health monitoring loops
    let probe = Arc::new(HttpProbe::new(config.monitor.probe_timeout));
    let monitor = Arc::new(ProviderMonitor::new(
        registry.clone(),
        engine.clone(),
        probe,
        config.monitor.clone(),
    ));
    tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.run_sweep_loop().await }
    });
    tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.run_quote_loop().await }
    });

    // API surface
    let state = Arc::new(ApiState {
        engine,
        registry,
        router,
        events,
        started_at: Instant::now(),
    });
    let app = api::create_router(state);

    let addr: SocketAddr = config.listen.parse()?;
    tracing::info!("🌐 Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
