//! Inference routing across the provider cluster
//!
//! A logical call walks the selection policy through the online set:
//! pick, call, and on failure pick again with the failed provider
//! excluded. When the retry budget or the candidate pool runs out, the
//! pinned cloud fallback gets exactly one attempt. Every attempt's
//! outcome is recorded against the provider that served it, the
//! fallback included, so routing itself keeps reputations honest.

use crate::provider::{OutcomeSource, Provider, ProviderRegistry, RegistryError};
use crate::selector::{ProviderSelector, SelectionOptions, SelectionStrategy};
use crate::types::ProviderId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Sampling temperature sent when the request leaves it unset
const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// One logical inference call, before provider selection
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// A served inference call, with the routing metadata attached
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResponse {
    pub content: String,
    pub tokens_used: u32,
    pub latency_ms: f64,
    pub provider_id: ProviderId,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider returned status {0}")]
    Status(u16),
    #[error("transport failure: {0}")]
    Network(String),
    #[error("malformed provider reply: {0}")]
    MalformedReply(String),
}

/// Raw reply from one provider call
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub content: String,
    pub tokens_used: u32,
    pub model: String,
}

/// Carries one request to one provider. The router owns retries and
/// outcome recording; a transport only speaks the wire.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    async fn call(
        &self,
        provider: &Provider,
        request: &InferenceRequest,
    ) -> Result<TransportReply, TransportError>;
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionReply {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u32,
}

/// OpenAI-style HTTP transport: POST `{address}/v1/chat/completions`
/// with an optional per-provider bearer credential.
pub struct HttpInferenceTransport {
    client: reqwest::Client,
    timeout: Duration,
    credentials: HashMap<ProviderId, String>,
}

impl HttpInferenceTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            credentials: HashMap::new(),
        }
    }

    /// Attach a bearer credential for one provider. The token is held
    /// opaquely and only ever sent to that provider's address.
    pub fn with_credential(mut self, provider: ProviderId, token: String) -> Self {
        self.credentials.insert(provider, token);
        self
    }
}

#[async_trait]
impl InferenceTransport for HttpInferenceTransport {
    async fn call(
        &self,
        provider: &Provider,
        request: &InferenceRequest,
    ) -> Result<TransportReply, TransportError> {
        let url = format!(
            "{}/v1/chat/completions",
            provider.address.trim_end_matches('/')
        );
        let model = provider.models.first().cloned().unwrap_or_default();
        let body = ChatCompletionBody {
            model: &model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            stream: false,
        };

        let mut outbound = self.client.post(&url).timeout(self.timeout).json(&body);
        if let Some(token) = self.credentials.get(&provider.id) {
            outbound = outbound.bearer_auth(token);
        }

        let response = outbound.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let reply: ChatCompletionReply = response
            .json()
            .await
            .map_err(|e| TransportError::MalformedReply(e.to_string()))?;
        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::MalformedReply("no choices in reply".into()))?;

        Ok(TransportReply {
            content: choice.message.content,
            tokens_used: reply.usage.map(|u| u.total_tokens).unwrap_or(0),
            model: reply.model.unwrap_or(model),
        })
    }
}

/// Router tuning
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Primary attempts per logical call, the initial try included
    pub max_retries: u32,
    /// Reputation floor for primary selection
    pub min_reputation: f64,
    /// Strategy used when the request does not name one
    pub strategy: SelectionStrategy,
    /// Pinned provider reserved for the final attempt. Never selected
    /// as a primary candidate.
    pub fallback_provider: Option<ProviderId>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            min_reputation: 50.0,
            strategy: SelectionStrategy::default(),
            fallback_provider: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid inference request: {0}")]
    InvalidRequest(&'static str),
    #[error("no provider could serve the request after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Routes inference calls across the cluster with retry and fallback
pub struct ClusterRouter {
    registry: Arc<ProviderRegistry>,
    selector: Arc<ProviderSelector>,
    transport: Arc<dyn InferenceTransport>,
    config: RouterConfig,
}

impl ClusterRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        selector: Arc<ProviderSelector>,
        transport: Arc<dyn InferenceTransport>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            transport,
            config,
        }
    }

    /// Serve one logical inference call. `strategy` overrides the
    /// configured default when set.
    pub async fn call(
        &self,
        request: InferenceRequest,
        strategy: Option<SelectionStrategy>,
    ) -> Result<InferenceResponse, RouterError> {
        validate(&request)?;
        let strategy = strategy.unwrap_or(self.config.strategy);

        // The fallback is reserved for the final attempt and never
        // competes as a primary candidate.
        let mut exclusions: HashSet<ProviderId> = HashSet::new();
        if let Some(fallback) = &self.config.fallback_provider {
            exclusions.insert(fallback.clone());
        }

        let mut attempts = 0u32;
        let mut last_error = String::from("no eligible provider");

        while attempts < self.config.max_retries {
            let snapshot = self.registry.snapshot()?;
            let opts = SelectionOptions {
                strategy,
                min_reputation: self.config.min_reputation,
                exclusions: exclusions.clone(),
            };
            let Some(provider) = self.selector.select(&snapshot, &opts) else {
                // Nothing left to try; skip straight to the fallback
                break;
            };

            attempts += 1;
            if attempts > 1 {
                warn!(
                    provider = %provider.id,
                    attempt = attempts,
                    "retrying inference on next candidate"
                );
            }
            match self.attempt(&provider, &request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    last_error = err.to_string();
                    exclusions.insert(provider.id.clone());
                }
            }
        }

        if let Some(fallback_id) = &self.config.fallback_provider {
            match self.registry.get(fallback_id)? {
                Some(provider) => {
                    attempts += 1;
                    warn!(provider = %provider.id, "primary candidates exhausted, using fallback");
                    match self.attempt(&provider, &request).await {
                        Ok(response) => return Ok(response),
                        Err(err) => last_error = err.to_string(),
                    }
                }
                None => {
                    warn!(provider = %fallback_id, "configured fallback provider is not registered");
                }
            }
        }

        error!(attempts, last_error = %last_error, "inference exhausted all providers");
        Err(RouterError::Exhausted {
            attempts,
            last_error,
        })
    }

    /// One attempt against one provider, with its outcome recorded
    /// whichever way it goes.
    async fn attempt(
        &self,
        provider: &Provider,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, TransportError> {
        let started = Instant::now();
        let result = self.transport.call(provider, request).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(reply) => {
                self.record(&provider.id, true, Some(latency_ms));
                info!(
                    provider = %provider.id,
                    latency_ms = latency_ms as u64,
                    tokens = reply.tokens_used,
                    "inference served"
                );
                Ok(InferenceResponse {
                    content: reply.content,
                    tokens_used: reply.tokens_used,
                    latency_ms,
                    provider_id: provider.id.clone(),
                    model: reply.model,
                })
            }
            Err(err) => {
                self.record(&provider.id, false, None);
                warn!(provider = %provider.id, error = %err, "inference attempt failed");
                Err(err)
            }
        }
    }

    fn record(&self, id: &ProviderId, success: bool, latency_ms: Option<f64>) {
        if let Err(err) =
            self.registry
                .record_outcome(id, OutcomeSource::Traffic, success, latency_ms)
        {
            error!(provider = %id, error = %err, "failed to record call outcome");
        }
    }
}

fn validate(request: &InferenceRequest) -> Result<(), RouterError> {
    if request.messages.is_empty() {
        return Err(RouterError::InvalidRequest("messages must not be empty"));
    }
    if request.max_tokens == 0 {
        return Err(RouterError::InvalidRequest("max_tokens must be positive"));
    }
    Ok(())
}
