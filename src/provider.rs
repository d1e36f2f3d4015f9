//! Compute provider registry
//!
//! Tracks every known provider's identity, health and traffic counters.
//! `record_outcome` is the single entry point through which both the
//! health monitor and the inference router mutate counters, so all
//! reputation math serializes in one place.

use crate::types::{Price, ProviderId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Latency smoothing weight for monitor probes
const PROBE_LATENCY_WEIGHT: f64 = 0.2;
/// Latency smoothing weight for live traffic
const TRAFFIC_LATENCY_WEIGHT: f64 = 0.3;

/// Reputation seed for statically configured providers
const STATIC_REPUTATION_SEED: f64 = 95.0;
/// Reputation seed for providers observed at runtime
const DISCOVERED_REPUTATION_SEED: f64 = 50.0;
/// Uptime credited to pinned providers, per their SLA
const PINNED_UPTIME: f64 = 99.9;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider registry lock poisoned")]
    LockPoisoned,
}

/// Liveness as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Online,
    Offline,
    /// Not probed yet
    Unknown,
}

/// How a provider entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOrigin {
    /// Listed in the service configuration
    Static,
    /// Observed at runtime
    Discovered,
}

/// Which path reported an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeSource {
    /// Health monitor probe
    Probe,
    /// A routed inference call
    Traffic,
}

impl OutcomeSource {
    fn latency_weight(&self) -> f64 {
        match self {
            OutcomeSource::Probe => PROBE_LATENCY_WEIGHT,
            OutcomeSource::Traffic => TRAFFIC_LATENCY_WEIGHT,
        }
    }
}

/// Static identity of a provider, as configured or discovered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub name: String,
    /// Base URL of the provider endpoint
    pub address: String,
    pub models: Vec<String>,
    pub region: String,
    /// List price per 1,000 tokens; live quotes adjust from here
    pub base_price: Price,
    pub origin: ProviderOrigin,
    /// Held online on an SLA instead of being probed
    #[serde(default)]
    pub pinned_online: bool,
}

/// A provider and its live metrics
#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub address: String,
    pub models: Vec<String>,
    pub region: String,
    pub origin: ProviderOrigin,
    pub pinned_online: bool,
    pub status: ProviderStatus,
    /// Smoothed latency; zero until the first sample lands
    pub latency_ms: f64,
    /// Percentage of observed time spent online, 0-100
    pub uptime: f64,
    /// round(100 * successful / total); seeded until traffic arrives
    pub reputation: f64,
    /// List price per 1,000 tokens, the anchor live quotes adjust from
    pub base_price: Price,
    /// Current quote per 1,000 tokens
    pub price: Price,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    /// Milliseconds spent online across past status stretches
    #[serde(skip_serializing)]
    accumulated_online_ms: i64,
    /// When the current status stretch began
    #[serde(skip_serializing)]
    status_since: DateTime<Utc>,
}

impl Provider {
    fn seed(desc: ProviderDescriptor, now: DateTime<Utc>) -> Self {
        let reputation = match desc.origin {
            ProviderOrigin::Static => STATIC_REPUTATION_SEED,
            ProviderOrigin::Discovered => DISCOVERED_REPUTATION_SEED,
        };
        let (status, uptime) = if desc.pinned_online {
            (ProviderStatus::Online, PINNED_UPTIME)
        } else {
            (ProviderStatus::Unknown, 0.0)
        };
        Self {
            id: desc.id,
            name: desc.name,
            address: desc.address,
            models: desc.models,
            region: desc.region,
            origin: desc.origin,
            pinned_online: desc.pinned_online,
            status,
            latency_ms: 0.0,
            uptime,
            reputation,
            base_price: desc.base_price,
            price: desc.base_price,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            consecutive_failures: 0,
            first_seen: now,
            last_seen: now,
            last_checked: now,
            accumulated_online_ms: 0,
            status_since: now,
        }
    }

    fn apply_outcome(
        &mut self,
        source: OutcomeSource,
        success: bool,
        latency_ms: Option<f64>,
        offline_threshold: u32,
        now: DateTime<Utc>,
    ) {
        self.total_requests += 1;
        self.last_checked = now;

        if success {
            self.successful_requests += 1;
            self.consecutive_failures = 0;
            self.last_seen = now;
            if let Some(sample) = latency_ms {
                self.latency_ms = if self.latency_ms == 0.0 {
                    sample
                } else {
                    ema(self.latency_ms, sample, source.latency_weight())
                };
            }
            self.transition(ProviderStatus::Online, now);
        } else {
            self.failed_requests += 1;
            self.consecutive_failures += 1;
            if !self.pinned_online && self.consecutive_failures >= offline_threshold {
                self.transition(ProviderStatus::Offline, now);
            }
        }

        self.recompute_reputation();
        self.recompute_uptime(now);
        self.check_bounds();
    }

    fn transition(&mut self, status: ProviderStatus, now: DateTime<Utc>) {
        if self.status == status {
            return;
        }
        if self.status == ProviderStatus::Online {
            let stretch = (now - self.status_since).num_milliseconds().max(0);
            self.accumulated_online_ms += stretch;
        }
        self.status = status;
        self.status_since = now;
    }

    fn recompute_reputation(&mut self) {
        if self.total_requests == 0 {
            return;
        }
        let ratio = self.successful_requests as f64 / self.total_requests as f64;
        self.reputation = (ratio * 100.0).round().clamp(0.0, 100.0);
    }

    fn recompute_uptime(&mut self, now: DateTime<Utc>) {
        if self.pinned_online {
            self.uptime = PINNED_UPTIME;
            return;
        }
        let total = (now - self.first_seen).num_milliseconds();
        if total <= 0 {
            return;
        }
        let mut online = self.accumulated_online_ms;
        if self.status == ProviderStatus::Online {
            online += (now - self.status_since).num_milliseconds().max(0);
        }
        self.uptime = (100.0 * online as f64 / total as f64).clamp(0.0, 100.0);
    }

    fn check_bounds(&self) {
        let in_bounds = (0.0..=100.0).contains(&self.reputation)
            && (0.0..=100.0).contains(&self.uptime)
            && self.successful_requests + self.failed_requests == self.total_requests;
        if !in_bounds {
            tracing::error!(
                provider = %self.id,
                reputation = self.reputation,
                uptime = self.uptime,
                "provider metrics out of bounds"
            );
            debug_assert!(in_bounds, "provider metrics out of bounds");
        }
    }
}

fn ema(old: f64, sample: f64, weight: f64) -> f64 {
    old * (1.0 - weight) + sample * weight
}

/// Summary of the provider market, online providers only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSummary {
    pub total_providers: usize,
    pub online_providers: usize,
    pub average_latency_ms: f64,
    pub average_price: Price,
    pub lowest_price: Option<Price>,
    pub highest_price: Option<Price>,
}

/// Registry of all known providers
pub struct ProviderRegistry {
    providers: RwLock<HashMap<ProviderId, Provider>>,
    offline_threshold: u32,
}

impl ProviderRegistry {
    /// `offline_threshold` is the consecutive-failure count that flips a
    /// provider offline.
    pub fn new(offline_threshold: u32) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            offline_threshold: offline_threshold.max(1),
        }
    }

    /// Insert a provider or refresh its static identity. Live counters
    /// and metrics are never touched by an upsert.
    pub fn upsert(&self, desc: ProviderDescriptor) -> Result<(), RegistryError> {
        let mut providers = self.providers.write().map_err(|_| RegistryError::LockPoisoned)?;
        let now = Utc::now();
        match providers.get_mut(&desc.id) {
            Some(existing) => {
                existing.name = desc.name;
                existing.address = desc.address;
                existing.models = desc.models;
                existing.region = desc.region;
                existing.base_price = desc.base_price;
                existing.last_seen = now;
            }
            None => {
                tracing::info!(provider = %desc.id, address = %desc.address, "📡 provider registered");
                providers.insert(desc.id.clone(), Provider::seed(desc, now));
            }
        }
        Ok(())
    }

    /// Record a probe or traffic outcome. Unknown ids are logged and
    /// ignored so a provider removed mid-flight cannot be resurrected.
    pub fn record_outcome(
        &self,
        id: &ProviderId,
        source: OutcomeSource,
        success: bool,
        latency_ms: Option<f64>,
    ) -> Result<(), RegistryError> {
        let mut providers = self.providers.write().map_err(|_| RegistryError::LockPoisoned)?;
        let provider = match providers.get_mut(id) {
            Some(provider) => provider,
            None => {
                tracing::warn!(provider = %id, "outcome for unknown provider ignored");
                return Ok(());
            }
        };

        let previous_status = provider.status;
        provider.apply_outcome(source, success, latency_ms, self.offline_threshold, Utc::now());

        if provider.status == ProviderStatus::Offline && previous_status != ProviderStatus::Offline {
            tracing::warn!(
                provider = %id,
                failures = provider.consecutive_failures,
                "provider marked offline after repeated failures"
            );
        }
        Ok(())
    }

    /// Update a provider's live quote.
    pub fn refresh_quote(&self, id: &ProviderId, price: Price) -> Result<(), RegistryError> {
        if !price.is_positive() {
            tracing::error!(provider = %id, price = %price, "rejecting non-positive quote");
            debug_assert!(price.is_positive(), "provider price must be positive");
            return Ok(());
        }
        let mut providers = self.providers.write().map_err(|_| RegistryError::LockPoisoned)?;
        if let Some(provider) = providers.get_mut(id) {
            provider.price = price;
        }
        Ok(())
    }

    /// Refresh bookkeeping for pinned providers without probing them.
    pub fn heartbeat_pinned(&self) -> Result<(), RegistryError> {
        let mut providers = self.providers.write().map_err(|_| RegistryError::LockPoisoned)?;
        let now = Utc::now();
        for provider in providers.values_mut().filter(|p| p.pinned_online) {
            provider.status = ProviderStatus::Online;
            provider.last_checked = now;
            provider.uptime = PINNED_UPTIME;
        }
        Ok(())
    }

    /// Point-in-time copy of every provider. Mutating the copy has no
    /// effect on the registry.
    pub fn snapshot(&self) -> Result<Vec<Provider>, RegistryError> {
        let providers = self.providers.read().map_err(|_| RegistryError::LockPoisoned)?;
        let mut all: Vec<Provider> = providers.values().cloned().collect();
        all.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(all)
    }

    pub fn get(&self, id: &ProviderId) -> Result<Option<Provider>, RegistryError> {
        let providers = self.providers.read().map_err(|_| RegistryError::LockPoisoned)?;
        Ok(providers.get(id).cloned())
    }

    /// Aggregate view over online providers.
    pub fn market_summary(&self) -> Result<MarketSummary, RegistryError> {
        let providers = self.providers.read().map_err(|_| RegistryError::LockPoisoned)?;
        let online: Vec<&Provider> = providers
            .values()
            .filter(|p| p.status == ProviderStatus::Online)
            .collect();

        let summary = if online.is_empty() {
            MarketSummary {
                total_providers: providers.len(),
                online_providers: 0,
                average_latency_ms: 0.0,
                average_price: Price::new(Decimal::ZERO),
                lowest_price: None,
                highest_price: None,
            }
        } else {
            let count = Decimal::from(online.len());
            let price_sum: Decimal = online.iter().map(|p| p.price.as_decimal()).sum();
            MarketSummary {
                total_providers: providers.len(),
                online_providers: online.len(),
                average_latency_ms: online.iter().map(|p| p.latency_ms).sum::<f64>()
                    / online.len() as f64,
                average_price: Price::new((price_sum / count).round_dp(6)),
                lowest_price: online.iter().map(|p| p.price).min(),
                highest_price: online.iter().map(|p| p.price).max(),
            }
        };
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn descriptor(id: &str, origin: ProviderOrigin) -> ProviderDescriptor {
        ProviderDescriptor {
            id: ProviderId::new(id),
            name: format!("node {id}"),
            address: format!("http://{id}.example:8000"),
            models: vec!["llama-70b".into()],
            region: "us-east".into(),
            base_price: Price::new(dec!(0.001)),
            origin,
            pinned_online: false,
        }
    }

    #[test]
    fn test_seed_reputation_by_origin() {
        let registry = ProviderRegistry::new(3);
        registry.upsert(descriptor("static-1", ProviderOrigin::Static)).unwrap();
        registry
            .upsert(descriptor("found-1", ProviderOrigin::Discovered))
            .unwrap();

        let snap = registry.snapshot().unwrap();
        let stat = snap.iter().find(|p| p.id.as_str() == "static-1").unwrap();
        let disc = snap.iter().find(|p| p.id.as_str() == "found-1").unwrap();
        assert_eq!(stat.reputation, 95.0);
        assert_eq!(disc.reputation, 50.0);
        assert_eq!(stat.status, ProviderStatus::Unknown);
    }

    #[test]
    fn test_upsert_preserves_counters() {
        let registry = ProviderRegistry::new(3);
        let id = ProviderId::new("p1");
        registry.upsert(descriptor("p1", ProviderOrigin::Static)).unwrap();
        registry
            .record_outcome(&id, OutcomeSource::Traffic, true, Some(40.0))
            .unwrap();

        let mut desc = descriptor("p1", ProviderOrigin::Static);
        desc.name = "renamed".into();
        registry.upsert(desc).unwrap();

        let p = registry.get(&id).unwrap().unwrap();
        assert_eq!(p.name, "renamed");
        assert_eq!(p.total_requests, 1);
        assert_eq!(p.successful_requests, 1);
    }

    #[test]
    fn test_reputation_follows_counters() {
        let registry = ProviderRegistry::new(100);
        let id = ProviderId::new("p1");
        registry.upsert(descriptor("p1", ProviderOrigin::Static)).unwrap();

        for _ in 0..3 {
            registry
                .record_outcome(&id, OutcomeSource::Traffic, true, Some(50.0))
                .unwrap();
        }
        registry
            .record_outcome(&id, OutcomeSource::Traffic, false, None)
            .unwrap();

        let p = registry.get(&id).unwrap().unwrap();
        assert_eq!(p.total_requests, 4);
        assert_eq!(p.reputation, 75.0);
        assert_eq!(p.failed_requests, 1);
    }

    #[test]
    fn test_ten_failures_zero_reputation_and_offline() {
        let registry = ProviderRegistry::new(3);
        let id = ProviderId::new("p1");
        registry.upsert(descriptor("p1", ProviderOrigin::Static)).unwrap();

        for _ in 0..10 {
            registry
                .record_outcome(&id, OutcomeSource::Probe, false, None)
                .unwrap();
        }

        let p = registry.get(&id).unwrap().unwrap();
        assert_eq!(p.reputation, 0.0);
        assert_eq!(p.status, ProviderStatus::Offline);
        assert_eq!(p.consecutive_failures, 10);
        assert_eq!(p.total_requests, 10);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let registry = ProviderRegistry::new(3);
        let id = ProviderId::new("p1");
        registry.upsert(descriptor("p1", ProviderOrigin::Static)).unwrap();

        registry.record_outcome(&id, OutcomeSource::Probe, false, None).unwrap();
        registry.record_outcome(&id, OutcomeSource::Probe, false, None).unwrap();
        registry
            .record_outcome(&id, OutcomeSource::Probe, true, Some(60.0))
            .unwrap();

        let p = registry.get(&id).unwrap().unwrap();
        assert_eq!(p.consecutive_failures, 0);
        assert_eq!(p.status, ProviderStatus::Online);
        // Two more failures stay under the threshold after the reset
        registry.record_outcome(&id, OutcomeSource::Probe, false, None).unwrap();
        registry.record_outcome(&id, OutcomeSource::Probe, false, None).unwrap();
        let p = registry.get(&id).unwrap().unwrap();
        assert_eq!(p.status, ProviderStatus::Online);
    }

    #[test]
    fn test_latency_ema_first_sample_direct() {
        let registry = ProviderRegistry::new(3);
        let id = ProviderId::new("p1");
        registry.upsert(descriptor("p1", ProviderOrigin::Static)).unwrap();

        registry
            .record_outcome(&id, OutcomeSource::Traffic, true, Some(100.0))
            .unwrap();
        let p = registry.get(&id).unwrap().unwrap();
        assert_eq!(p.latency_ms, 100.0);

        // Traffic smoothing: 0.7 * 100 + 0.3 * 200 = 130
        registry
            .record_outcome(&id, OutcomeSource::Traffic, true, Some(200.0))
            .unwrap();
        let p = registry.get(&id).unwrap().unwrap();
        assert!((p.latency_ms - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_probe_smoothing_weight() {
        let registry = ProviderRegistry::new(3);
        let id = ProviderId::new("p1");
        registry.upsert(descriptor("p1", ProviderOrigin::Static)).unwrap();

        registry
            .record_outcome(&id, OutcomeSource::Probe, true, Some(100.0))
            .unwrap();
        // Probe smoothing: 0.8 * 100 + 0.2 * 200 = 120
        registry
            .record_outcome(&id, OutcomeSource::Probe, true, Some(200.0))
            .unwrap();
        let p = registry.get(&id).unwrap().unwrap();
        assert!((p.latency_ms - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_provider_outcome_is_noop() {
        let registry = ProviderRegistry::new(3);
        registry
            .record_outcome(&ProviderId::new("ghost"), OutcomeSource::Probe, true, Some(1.0))
            .unwrap();
        assert!(registry.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_pinned_provider_never_flips_offline() {
        let registry = ProviderRegistry::new(2);
        let mut desc = descriptor("cloud", ProviderOrigin::Static);
        desc.pinned_online = true;
        registry.upsert(desc).unwrap();
        let id = ProviderId::new("cloud");

        for _ in 0..5 {
            registry
                .record_outcome(&id, OutcomeSource::Traffic, false, None)
                .unwrap();
        }

        let p = registry.get(&id).unwrap().unwrap();
        assert_eq!(p.status, ProviderStatus::Online);
        assert_eq!(p.uptime, 99.9);
        // Counters still tell the truth
        assert_eq!(p.failed_requests, 5);
        assert_eq!(p.reputation, 0.0);
    }

    #[test]
    fn test_quote_refresh_updates_price() {
        let registry = ProviderRegistry::new(3);
        registry.upsert(descriptor("p1", ProviderOrigin::Static)).unwrap();
        let id = ProviderId::new("p1");

        registry.refresh_quote(&id, Price::new(dec!(0.0015))).unwrap();
        assert_eq!(
            registry.get(&id).unwrap().unwrap().price,
            Price::new(dec!(0.0015))
        );
    }

    #[test]
    fn test_market_summary() {
        let registry = ProviderRegistry::new(3);
        for (name, price) in [("a", dec!(0.001)), ("b", dec!(0.003))] {
            let mut desc = descriptor(name, ProviderOrigin::Static);
            desc.base_price = Price::new(price);
            registry.upsert(desc).unwrap();
            registry
                .record_outcome(&ProviderId::new(name), OutcomeSource::Probe, true, Some(50.0))
                .unwrap();
        }
        // One offline provider, excluded from averages
        registry.upsert(descriptor("c", ProviderOrigin::Static)).unwrap();

        let summary = registry.market_summary().unwrap();
        assert_eq!(summary.total_providers, 3);
        assert_eq!(summary.online_providers, 2);
        assert_eq!(summary.average_price, Price::new(dec!(0.002)));
        assert_eq!(summary.lowest_price, Some(Price::new(dec!(0.001))));
        assert_eq!(summary.highest_price, Some(Price::new(dec!(0.003))));
        assert_eq!(summary.average_latency_ms, 50.0);
    }

    #[test]
    fn test_uptime_stays_bounded() {
        let registry = ProviderRegistry::new(3);
        registry.upsert(descriptor("p1", ProviderOrigin::Static)).unwrap();
        let id = ProviderId::new("p1");

        for i in 0..20 {
            registry
                .record_outcome(&id, OutcomeSource::Probe, i % 3 != 0, Some(25.0))
                .unwrap();
        }
        let p = registry.get(&id).unwrap().unwrap();
        assert!((0.0..=100.0).contains(&p.uptime));
        assert!((0.0..=100.0).contains(&p.reputation));
    }
}
