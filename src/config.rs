//! Service configuration
//!
//! Plain config structs with defaults and `COMPUTE_DEX_*` environment
//! overrides. There are no config files; everything an operator tunes
//! comes in through the environment, starting with the seed provider
//! endpoint list.

use crate::provider::{ProviderDescriptor, ProviderOrigin};
use crate::types::{Price, ProviderId};
use rust_decimal_macros::dec;
use std::str::FromStr;
use std::time::Duration;

/// Registry id of the pinned cloud fallback provider
pub const FALLBACK_PROVIDER_ID: &str = "cloud-fallback";

/// Timing for the health monitor loops
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Full discovery sweep cadence
    pub sweep_interval: Duration,
    /// Book-facing quote refresh cadence, faster than the sweep
    pub quote_refresh_interval: Duration,
    /// Per-probe budget; a probe that misses it counts as a failure
    pub probe_timeout: Duration,
    /// Consecutive failures before a provider flips offline
    pub offline_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            quote_refresh_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            offline_threshold: 3,
        }
    }
}

/// Tuning for the inference router
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Primary attempts per logical call, the initial try included
    pub max_retries: u32,
    /// Outbound inference call budget
    pub request_timeout: Duration,
    /// Reputation floor for primary selection
    pub min_reputation: f64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            request_timeout: Duration::from_secs(30),
            min_reputation: 50.0,
        }
    }
}

/// Managed cloud endpoint used once every primary candidate is spent.
/// Only present when both the URL and the API key are configured.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub address: String,
    pub model: String,
    /// Opaque bearer credential; the router never inspects it
    pub api_key: String,
    /// Cloud list price per 1,000 tokens
    pub price: Price,
}

/// Top-level service configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Socket address the HTTP server binds
    pub listen: String,
    /// Seed provider endpoints, probed from startup
    pub provider_urls: Vec<String>,
    /// Model advertised for seeded providers
    pub default_model: String,
    /// List price per 1,000 compute tokens before latency adjustment
    pub base_price: Price,
    pub monitor: MonitorConfig,
    pub router: RouterSettings,
    pub fallback: Option<FallbackConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            provider_urls: vec!["http://localhost:3001".to_string()],
            default_model: "qwen3-0.6b".to_string(),
            base_price: Price::new(dec!(0.001)),
            monitor: MonitorConfig::default(),
            router: RouterSettings::default(),
            fallback: None,
        }
    }
}

impl CoreConfig {
    /// Read configuration from `COMPUTE_DEX_*` variables, keeping the
    /// default for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let provider_urls = std::env::var("COMPUTE_DEX_PROVIDER_URLS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty())
            .unwrap_or(defaults.provider_urls);

        let fallback = match (
            std::env::var("COMPUTE_DEX_FALLBACK_URL"),
            std::env::var("COMPUTE_DEX_FALLBACK_API_KEY"),
        ) {
            (Ok(address), Ok(api_key)) => Some(FallbackConfig {
                address,
                model: env_or("COMPUTE_DEX_FALLBACK_MODEL", "gpt-oss-120b"),
                api_key,
                price: Price::new(env_parsed("COMPUTE_DEX_FALLBACK_PRICE", dec!(0.00045))),
            }),
            (Ok(_), Err(_)) | (Err(_), Ok(_)) => {
                tracing::warn!(
                    "fallback needs both COMPUTE_DEX_FALLBACK_URL and \
                     COMPUTE_DEX_FALLBACK_API_KEY; fallback disabled"
                );
                None
            }
            _ => None,
        };

        Self {
            listen: env_or("COMPUTE_DEX_LISTEN", &defaults.listen),
            provider_urls,
            default_model: env_or("COMPUTE_DEX_DEFAULT_MODEL", &defaults.default_model),
            base_price: Price::new(env_parsed(
                "COMPUTE_DEX_BASE_PRICE",
                defaults.base_price.as_decimal(),
            )),
            monitor: MonitorConfig {
                sweep_interval: Duration::from_secs(env_parsed(
                    "COMPUTE_DEX_SWEEP_INTERVAL_SECS",
                    30u64,
                )),
                quote_refresh_interval: Duration::from_secs(env_parsed(
                    "COMPUTE_DEX_QUOTE_REFRESH_SECS",
                    5u64,
                )),
                probe_timeout: Duration::from_secs(env_parsed(
                    "COMPUTE_DEX_PROBE_TIMEOUT_SECS",
                    5u64,
                )),
                offline_threshold: env_parsed("COMPUTE_DEX_OFFLINE_THRESHOLD", 3u32),
            },
            router: RouterSettings {
                max_retries: env_parsed("COMPUTE_DEX_MAX_RETRIES", 2u32),
                request_timeout: Duration::from_secs(env_parsed(
                    "COMPUTE_DEX_REQUEST_TIMEOUT_SECS",
                    30u64,
                )),
                min_reputation: env_parsed("COMPUTE_DEX_MIN_REPUTATION", 50.0f64),
            },
            fallback,
        }
    }

    /// Descriptors for every statically configured provider. The pinned
    /// cloud fallback is included when one is configured: it trades on
    /// the book like any other provider but is held online on its SLA
    /// instead of being probed.
    pub fn seed_descriptors(&self) -> Vec<ProviderDescriptor> {
        let mut seeds: Vec<ProviderDescriptor> = self
            .provider_urls
            .iter()
            .map(|url| {
                let slug = slugify(url);
                ProviderDescriptor {
                    id: ProviderId::new(format!("node-{slug}")),
                    name: format!("edge node {slug}"),
                    address: url.clone(),
                    models: vec![self.default_model.clone()],
                    region: infer_region(url),
                    base_price: self.base_price,
                    origin: ProviderOrigin::Static,
                    pinned_online: false,
                }
            })
            .collect();

        if let Some(fallback) = &self.fallback {
            seeds.push(ProviderDescriptor {
                id: ProviderId::new(FALLBACK_PROVIDER_ID),
                name: "cloud fallback".to_string(),
                address: fallback.address.clone(),
                models: vec![fallback.model.clone()],
                region: "global".to_string(),
                base_price: fallback.price,
                origin: ProviderOrigin::Static,
                pinned_online: true,
            });
        }

        seeds
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparseable setting, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn slugify(url: &str) -> String {
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let mut slug: String = stripped
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    slug.trim_matches('-').to_string()
}

fn infer_region(url: &str) -> String {
    if url.contains("localhost") || url.contains("127.0.0.1") {
        "local".to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.provider_urls, vec!["http://localhost:3001"]);
        assert_eq!(config.monitor.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.monitor.quote_refresh_interval, Duration::from_secs(5));
        assert_eq!(config.monitor.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.router.max_retries, 2);
        assert!(config.fallback.is_none());
    }

    #[test]
    fn test_slugify_strips_scheme_and_punctuation() {
        assert_eq!(slugify("http://localhost:3001"), "localhost-3001");
        assert_eq!(slugify("https://node-2.example.io:8443/"), "node-2-example-io-8443");
    }

    #[test]
    fn test_seed_descriptors_without_fallback() {
        let config = CoreConfig {
            provider_urls: vec![
                "http://localhost:3001".to_string(),
                "http://10.0.0.7:3001".to_string(),
            ],
            ..Default::default()
        };
        let seeds = config.seed_descriptors();

        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].id, ProviderId::new("node-localhost-3001"));
        assert_eq!(seeds[0].region, "local");
        assert_eq!(seeds[1].region, "unknown");
        assert!(seeds.iter().all(|s| !s.pinned_online));
        assert!(seeds.iter().all(|s| s.origin == ProviderOrigin::Static));
    }

    #[test]
    fn test_seed_descriptors_append_pinned_fallback() {
        let config = CoreConfig {
            fallback: Some(FallbackConfig {
                address: "https://cloud.example/v1".to_string(),
                model: "gpt-oss-120b".to_string(),
                api_key: "test-key".to_string(),
                price: Price::new(dec!(0.00045)),
            }),
            ..Default::default()
        };
        let seeds = config.seed_descriptors();

        let fallback = seeds.last().unwrap();
        assert_eq!(fallback.id, ProviderId::new(FALLBACK_PROVIDER_ID));
        assert!(fallback.pinned_online);
        assert_eq!(fallback.base_price, Price::new(dec!(0.00045)));
    }

    #[test]
    fn test_env_overrides_and_bad_values() {
        std::env::set_var("COMPUTE_DEX_MAX_RETRIES", "5");
        std::env::set_var("COMPUTE_DEX_MIN_REPUTATION", "not-a-number");

        let config = CoreConfig::from_env();
        assert_eq!(config.router.max_retries, 5);
        // Unparseable values fall back to the default
        assert_eq!(config.router.min_reputation, 50.0);

        std::env::remove_var("COMPUTE_DEX_MAX_RETRIES");
        std::env::remove_var("COMPUTE_DEX_MIN_REPUTATION");
    }
}
