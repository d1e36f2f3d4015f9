//! Provider health monitoring
//!
//! Two background loops keep the registry honest: a discovery sweep that
//! probes every non-pinned provider, and a faster quote refresh that
//! reprices the provider-backed asks on the book. Probes run concurrently
//! against a registry snapshot, each under its own timeout, and their
//! outcomes are folded back in as short bounded mutations. A stuck probe
//! can never stall the scheduler or hold a registry lock.

use crate::config::MonitorConfig;
use crate::engine::MatchingEngine;
use crate::provider::{OutcomeSource, ProviderRegistry, ProviderStatus, RegistryError};
use crate::types::Price;
use async_trait::async_trait;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

/// Latency divisor for the dynamic quote: every full 100ms of smoothed
/// latency scales the base price up by another 1x.
const LATENCY_PRICE_STEP_MS: f64 = 100.0;

#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("provider unreachable: {0}")]
    Unreachable(String),
}

/// Reachability check against a provider address. Any response inside
/// the budget counts as alive, whatever the payload says.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns the observed round-trip latency in milliseconds.
    async fn probe(&self, address: &str) -> Result<f64, ProbeError>;
}

/// HTTP GET against the provider's base address.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: std::time::Duration,
}

impl HttpProbe {
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, address: &str) -> Result<f64, ProbeError> {
        let started = Instant::now();
        match self.client.get(address).timeout(self.timeout).send().await {
            // Any status proves the server is up, an error page included
            Ok(_) => Ok(started.elapsed().as_secs_f64() * 1000.0),
            Err(e) if e.is_timeout() => Err(ProbeError::Timeout),
            Err(e) => Err(ProbeError::Unreachable(e.to_string())),
        }
    }
}

/// What one discovery sweep observed
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub probed: usize,
    pub online: usize,
}

/// Background monitor driving provider discovery and quote refresh
pub struct ProviderMonitor {
    registry: Arc<ProviderRegistry>,
    engine: Arc<MatchingEngine>,
    probe: Arc<dyn HealthProbe>,
    config: MonitorConfig,
}

impl ProviderMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        engine: Arc<MatchingEngine>,
        probe: Arc<dyn HealthProbe>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            probe,
            config,
        }
    }

    /// Probe every non-pinned provider once and fold the outcomes into
    /// the registry. Pinned providers get a heartbeat instead of a probe.
    pub async fn sweep_once(&self) -> Result<SweepReport, RegistryError> {
        let snapshot = self.registry.snapshot()?;
        let probes = snapshot
            .iter()
            .filter(|p| !p.pinned_online)
            .map(|p| {
                let probe = self.probe.clone();
                let id = p.id.clone();
                let address = p.address.clone();
                let budget = self.config.probe_timeout;
                async move {
                    let outcome = match timeout(budget, probe.probe(&address)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProbeError::Timeout),
                    };
                    (id, outcome)
                }
            });
        let outcomes = join_all(probes).await;

        let mut report = SweepReport {
            probed: outcomes.len(),
            online: 0,
        };
        for (id, outcome) in outcomes {
            match outcome {
                Ok(latency_ms) => {
                    report.online += 1;
                    self.registry
                        .record_outcome(&id, OutcomeSource::Probe, true, Some(latency_ms))?;
                }
                Err(err) => {
                    debug!(provider = %id, error = %err, "probe failed");
                    self.registry
                        .record_outcome(&id, OutcomeSource::Probe, false, None)?;
                }
            }
        }
        self.registry.heartbeat_pinned()?;
        Ok(report)
    }

    /// Re-quote every online provider from its smoothed latency, then
    /// resynchronize the book's provider asks against the result.
    pub async fn refresh_quotes_once(&self) -> Result<(), RegistryError> {
        let snapshot = self.registry.snapshot()?;
        for provider in snapshot
            .iter()
            .filter(|p| p.status == ProviderStatus::Online)
        {
            let quote = dynamic_price(provider.base_price, provider.latency_ms);
            self.registry.refresh_quote(&provider.id, quote)?;
        }

        let refreshed = self.registry.snapshot()?;
        if let Err(err) = self.engine.sync_provider_asks(&refreshed) {
            warn!(error = %err, "provider ask resync failed");
        }
        Ok(())
    }

    /// Discovery sweep loop. Never returns; run it on its own task.
    pub async fn run_sweep_loop(&self) {
        info!(interval = ?self.config.sweep_interval, "🔍 Provider discovery sweep started");
        let mut ticker = interval(self.config.sweep_interval);
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) => {
                    info!(
                        online = report.online,
                        probed = report.probed,
                        "sweep complete"
                    );
                }
                Err(err) => warn!(error = %err, "sweep failed"),
            }
        }
    }

    /// Book-facing quote refresh loop, faster than the sweep.
    pub async fn run_quote_loop(&self) {
        info!(interval = ?self.config.quote_refresh_interval, "📈 Quote refresh started");
        let mut ticker = interval(self.config.quote_refresh_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh_quotes_once().await {
                warn!(error = %err, "quote refresh failed");
            }
        }
    }
}

/// Quote a provider from its base price and smoothed latency. Latency
/// under one step leaves the base price untouched.
pub(crate) fn dynamic_price(base: Price, latency_ms: f64) -> Price {
    let factor = (latency_ms / LATENCY_PRICE_STEP_MS).max(1.0);
    let factor = Decimal::try_from(factor).unwrap_or(Decimal::ONE);
    Price::new((base.as_decimal() * factor).round_dp(6))
}
