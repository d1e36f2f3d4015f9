//! Provider selection policies
//!
//! Selection is a pure function over a registry snapshot: no locks are
//! taken and concurrent callers only contend on one atomic cursor.

use crate::provider::{Provider, ProviderStatus};
use crate::types::ProviderId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Latency gap treated as a tie; within it, reputation decides
const LATENCY_TIE_MS: f64 = 10.0;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Rotate through eligible providers in order
    RoundRobin,
    /// Lowest smoothed latency first
    #[default]
    LatencyBased,
    /// Uniform over the eligible set
    Random,
}

/// Per-call selection inputs
#[derive(Debug, Clone, Default)]
pub struct SelectionOptions {
    pub strategy: SelectionStrategy,
    /// Providers below this reputation are skipped
    pub min_reputation: f64,
    /// Providers already tried in this request
    pub exclusions: HashSet<ProviderId>,
}

/// Stateless selector, except for the round-robin cursor which persists
/// across calls.
pub struct ProviderSelector {
    cursor: AtomicUsize,
}

impl Default for ProviderSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderSelector {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick one provider from the snapshot. `None` means no eligible
    /// candidate; callers treat that as a signal, not an error.
    pub fn select(&self, snapshot: &[Provider], opts: &SelectionOptions) -> Option<Provider> {
        let eligible: Vec<&Provider> = snapshot
            .iter()
            .filter(|p| Self::is_eligible(p, opts))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match opts.strategy {
            SelectionStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % eligible.len();
                eligible[idx]
            }
            SelectionStrategy::LatencyBased => {
                let mut best = eligible[0];
                for candidate in eligible.iter().skip(1) {
                    if Self::faster(candidate, best) {
                        best = candidate;
                    }
                }
                best
            }
            SelectionStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..eligible.len());
                eligible[idx]
            }
        };

        Some(chosen.clone())
    }

    fn is_eligible(provider: &Provider, opts: &SelectionOptions) -> bool {
        provider.status == ProviderStatus::Online
            && provider.reputation >= opts.min_reputation
            && !opts.exclusions.contains(&provider.id)
    }

    /// Strictly lower latency wins; within the tie window the higher
    /// reputation does.
    fn faster(a: &Provider, b: &Provider) -> bool {
        if (a.latency_ms - b.latency_ms).abs() <= LATENCY_TIE_MS {
            a.reputation > b.reputation
        } else {
            a.latency_ms < b.latency_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        OutcomeSource, ProviderDescriptor, ProviderOrigin, ProviderRegistry,
    };
    use crate::types::Price;
    use rust_decimal_macros::dec;

    fn registry_with(providers: &[(&str, f64)]) -> ProviderRegistry {
        let registry = ProviderRegistry::new(3);
        for (id, latency) in providers {
            registry
                .upsert(ProviderDescriptor {
                    id: ProviderId::new(*id),
                    name: (*id).to_string(),
                    address: format!("http://{id}:8000"),
                    models: vec!["llama-70b".into()],
                    region: "us-east".into(),
                    base_price: Price::new(dec!(0.001)),
                    origin: ProviderOrigin::Static,
                    pinned_online: false,
                })
                .unwrap();
            registry
                .record_outcome(
                    &ProviderId::new(*id),
                    OutcomeSource::Probe,
                    true,
                    Some(*latency),
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_empty_snapshot_selects_none() {
        let selector = ProviderSelector::new();
        assert!(selector.select(&[], &SelectionOptions::default()).is_none());
    }

    #[test]
    fn test_offline_and_low_reputation_are_ineligible() {
        let registry = registry_with(&[("a", 40.0), ("b", 50.0)]);
        // Push "a" offline
        for _ in 0..3 {
            registry
                .record_outcome(&ProviderId::new("a"), OutcomeSource::Probe, false, None)
                .unwrap();
        }
        let snapshot = registry.snapshot().unwrap();

        let selector = ProviderSelector::new();
        let opts = SelectionOptions {
            min_reputation: 50.0,
            ..Default::default()
        };
        let picked = selector.select(&snapshot, &opts).unwrap();
        assert_eq!(picked.id, ProviderId::new("b"));

        // Raising the floor above everyone leaves no candidate
        let opts = SelectionOptions {
            min_reputation: 100.5,
            ..Default::default()
        };
        assert!(selector.select(&snapshot, &opts).is_none());
    }

    #[test]
    fn test_exclusions_remove_candidates() {
        let registry = registry_with(&[("a", 40.0), ("b", 50.0)]);
        let snapshot = registry.snapshot().unwrap();
        let selector = ProviderSelector::new();

        let mut exclusions = HashSet::new();
        exclusions.insert(ProviderId::new("a"));
        let opts = SelectionOptions {
            strategy: SelectionStrategy::LatencyBased,
            exclusions,
            ..Default::default()
        };
        let picked = selector.select(&snapshot, &opts).unwrap();
        assert_eq!(picked.id, ProviderId::new("b"));
    }

    #[test]
    fn test_round_robin_cursor_persists() {
        let registry = registry_with(&[("a", 40.0), ("b", 50.0)]);
        let snapshot = registry.snapshot().unwrap();
        let selector = ProviderSelector::new();
        let opts = SelectionOptions {
            strategy: SelectionStrategy::RoundRobin,
            ..Default::default()
        };

        let first = selector.select(&snapshot, &opts).unwrap();
        let second = selector.select(&snapshot, &opts).unwrap();
        let third = selector.select(&snapshot, &opts).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.id, third.id);
    }

    #[test]
    fn test_latency_based_prefers_fastest() {
        let registry = registry_with(&[("slow", 120.0), ("fast", 35.0), ("mid", 80.0)]);
        let snapshot = registry.snapshot().unwrap();
        let selector = ProviderSelector::new();
        let opts = SelectionOptions {
            strategy: SelectionStrategy::LatencyBased,
            ..Default::default()
        };

        let picked = selector.select(&snapshot, &opts).unwrap();
        assert_eq!(picked.id, ProviderId::new("fast"));
    }

    #[test]
    fn test_latency_tie_breaks_on_reputation() {
        let registry = registry_with(&[("a", 42.0), ("b", 45.0)]);
        // Drag "a"'s reputation down without flipping it offline
        registry
            .record_outcome(&ProviderId::new("a"), OutcomeSource::Traffic, false, None)
            .unwrap();
        let snapshot = registry.snapshot().unwrap();

        let a = snapshot.iter().find(|p| p.id.as_str() == "a").unwrap();
        let b = snapshot.iter().find(|p| p.id.as_str() == "b").unwrap();
        assert!(a.reputation < b.reputation);
        assert!((a.latency_ms - b.latency_ms).abs() <= LATENCY_TIE_MS);

        let selector = ProviderSelector::new();
        let opts = SelectionOptions {
            strategy: SelectionStrategy::LatencyBased,
            ..Default::default()
        };
        // "b" is slightly slower but wins the tie on reputation
        let picked = selector.select(&snapshot, &opts).unwrap();
        assert_eq!(picked.id, ProviderId::new("b"));
    }

    #[test]
    fn test_random_picks_from_eligible_set() {
        let registry = registry_with(&[("a", 40.0), ("b", 50.0), ("c", 60.0)]);
        let snapshot = registry.snapshot().unwrap();
        let selector = ProviderSelector::new();
        let opts = SelectionOptions {
            strategy: SelectionStrategy::Random,
            ..Default::default()
        };

        for _ in 0..20 {
            let picked = selector.select(&snapshot, &opts).unwrap();
            assert!(["a", "b", "c"].contains(&picked.id.as_str()));
        }
    }
}
