//! LLM gateway: one uniform request/stream surface over the configured
//! providers, with retry and provider-local key rotation underneath.

pub mod keys;
pub mod providers;
pub mod retry;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use thiserror::Error;
use tracing::{info, warn};

use crate::config_service::{GatewayConfig, LlmConfig};
use keys::KeyRotation;
use retry::RetryPolicy;

/// Lazy, finite, non-restartable sequence of content deltas.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("credential rejected: {0}")]
    Auth(String),

    #[error("{provider} rate limited: {message}")]
    RateLimited {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("request to {provider} timed out")]
    Timeout { provider: &'static str },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("empty response from {provider}")]
    EmptyResponse { provider: &'static str },

    #[error("stream error from {provider}: {message}")]
    Stream {
        provider: &'static str,
        message: String,
    },
}

impl LlmError {
    /// 5xx, 429, timeouts and transport errors are worth another attempt;
    /// other 4xx responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout { .. } | LlmError::Network(_) => true,
            LlmError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Rate limits back off from 5 s, everything else from 2 s.
    pub fn backoff_base(&self) -> Duration {
        match self {
            LlmError::RateLimited { .. } => Duration::from_secs(5),
            _ => Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct LlmGateway {
    http: reqwest::Client,
    keys: Arc<KeyRotation>,
    retry: RetryPolicy,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl LlmGateway {
    pub fn new(cfg: &GatewayConfig, llm: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(cfg.pool_keep_alive)
            .build()?;

        let pool = llm
            .gemini
            .as_ref()
            .map(Self::gemini_key_pool)
            .unwrap_or_default();
        let keys = Arc::new(KeyRotation::new(
            pool,
            Duration::from_secs(cfg.key_cooldown_secs),
        ));

        Ok(Self {
            http,
            keys,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            stream_timeout: Duration::from_secs(cfg.stream_timeout_secs),
        })
    }

    pub fn key_rotation(&self) -> &KeyRotation {
        &self.keys
    }

    /// The model name that will serve requests for the configured default
    /// provider, for response metadata.
    pub fn model_name(&self, llm: &LlmConfig) -> String {
        match llm.default_provider.as_str() {
            "gemini" => llm
                .gemini
                .as_ref()
                .map(|c| c.model.clone())
                .unwrap_or_default(),
            "openai" => llm
                .openai
                .as_ref()
                .map(|c| c.model.clone())
                .unwrap_or_default(),
            "vllm" => llm
                .vllm
                .as_ref()
                .map(|c| c.model.clone())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// One-shot generation against the configured default provider.
    pub async fn generate(
        &self,
        llm: &LlmConfig,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<String, LlmError> {
        match llm.default_provider.as_str() {
            "gemini" => self.generate_gemini(llm, prompt, context).await,
            "openai" => {
                let cfg = llm
                    .openai
                    .as_ref()
                    .ok_or_else(|| LlmError::NotConfigured("openai".into()))?;
                retry::retry_llm(self.retry, || {
                    providers::openai_generate(
                        &self.http,
                        cfg,
                        prompt,
                        context,
                        self.request_timeout,
                    )
                })
                .await
            }
            "vllm" => {
                let cfg = llm
                    .vllm
                    .as_ref()
                    .ok_or_else(|| LlmError::NotConfigured("vllm".into()))?;
                retry::retry_llm(self.retry, || {
                    providers::vllm_generate(&self.http, cfg, prompt, context, self.request_timeout)
                })
                .await
            }
            other => Err(LlmError::NotConfigured(other.to_string())),
        }
    }

    /// Streaming generation. The returned stream is finite and must be
    /// consumed in order; it is not restartable.
    pub async fn stream(
        &self,
        llm: &LlmConfig,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<TextStream, LlmError> {
        match llm.default_provider.as_str() {
            "gemini" => {
                let cfg = llm
                    .gemini
                    .as_ref()
                    .ok_or_else(|| LlmError::NotConfigured("gemini".into()))?;
                self.keys.sync_pool(&Self::gemini_key_pool(cfg));
                let key = self
                    .keys
                    .next_key()
                    .ok_or_else(|| LlmError::Auth("no enabled gemini API key".into()))?;
                providers::gemini_stream(&self.http, cfg, &key, prompt, context, self.stream_timeout)
                    .await
            }
            "openai" => {
                let cfg = llm
                    .openai
                    .as_ref()
                    .ok_or_else(|| LlmError::NotConfigured("openai".into()))?;
                providers::openai_stream(&self.http, cfg, prompt, context, self.stream_timeout).await
            }
            "vllm" => {
                let cfg = llm
                    .vllm
                    .as_ref()
                    .ok_or_else(|| LlmError::NotConfigured("vllm".into()))?;
                providers::vllm_stream(&self.http, cfg, prompt, context, self.stream_timeout).await
            }
            other => Err(LlmError::NotConfigured(other.to_string())),
        }
    }

    /// The configured Gemini keys (primary first, then the extras).
    fn gemini_key_pool(cfg: &crate::config_service::GeminiProviderConfig) -> Vec<String> {
        let mut pool = Vec::new();
        if let Some(primary) = cfg.api_key.as_deref() {
            if !primary.trim().is_empty() {
                pool.push(primary.to_string());
            }
        }
        pool.extend(
            cfg.extra_api_keys
                .iter()
                .filter(|k| !k.trim().is_empty())
                .cloned(),
        );
        pool
    }

    /// Gemini generation walks the rotation pool: on a rate-limit or auth
    /// failure the current key cools down and the next enabled key is tried.
    async fn generate_gemini(
        &self,
        llm: &LlmConfig,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<String, LlmError> {
        let cfg = llm
            .gemini
            .as_ref()
            .ok_or_else(|| LlmError::NotConfigured("gemini".into()))?;
        self.keys.sync_pool(&Self::gemini_key_pool(cfg));

        let attempts = self.keys.enabled_count().max(1);
        let mut last_err = None;

        for _ in 0..attempts {
            let key = self
                .keys
                .next_key()
                .ok_or_else(|| LlmError::Auth("no enabled gemini API key".into()))?;

            let result = retry::retry_llm(self.retry, || {
                providers::gemini_generate(
                    &self.http,
                    cfg,
                    &key,
                    prompt,
                    context,
                    self.request_timeout,
                )
            })
            .await;

            match result {
                Ok(text) => return Ok(text),
                Err(err @ (LlmError::RateLimited { .. } | LlmError::Auth(_))) => {
                    warn!(
                        key = %keys::masked_key(&key),
                        error = %err,
                        "gemini key cooled down, rotating"
                    );
                    platform::record_counter("gateway_key_rotations_total", 1);
                    self.keys.mark_cooldown(&key);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or(LlmError::Auth("all gemini keys exhausted".into())))
    }

    /// Validate a candidate Gemini key with the models meta-call before it
    /// may be enabled in the rotation pool.
    pub async fn validate_gemini_key(&self, key: &str) -> Result<(), LlmError> {
        providers::gemini_validate_key(&self.http, key).await?;
        info!(key = %keys::masked_key(key), "gemini key validated");
        Ok(())
    }
}
