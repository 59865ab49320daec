//! Provider configuration: TOML on disk with environment interpolation,
//! an environment-specific overlay, and masked secrets at the API surface.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::llm::keys::masked_key;

const MASK_PREFIX: &str = "****";

/// `{{VAR}}` or `${VAR}` placeholders inside the raw TOML body.
static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\{\{|\$\{)([A-Za-z0-9_]+)(\}\}|\})").expect("env placeholder regex"));

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GeminiProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_api_keys: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct OpenAiProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VllmProviderConfig {
    #[serde(default = "default_vllm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_vllm_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for VllmProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_vllm_endpoint(),
            model: default_vllm_model(),
            api_key: None,
        }
    }
}

fn default_gemini_model() -> String {
    "gemini-2.5-pro".to_string()
}
fn default_openai_model() -> String {
    "gpt-4".to_string()
}
fn default_vllm_endpoint() -> String {
    "http://localhost:8000".to_string()
}
fn default_vllm_model() -> String {
    "default".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LlmConfig {
    pub default_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini: Option<GeminiProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai: Option<OpenAiProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vllm: Option<VllmProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: "gemini".to_string(),
            gemini: None,
            openai: None,
            vllm: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub max_refine_attempts: u32,
    pub max_replan_events: u32,
    pub pip_index_option: String,
    pub knowledge_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_refine_attempts: 3,
            max_replan_events: 5,
            pip_index_option: String::new(),
            knowledge_dir: "data/knowledge".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub request_timeout_secs: u64,
    pub stream_timeout_secs: u64,
    pub key_cooldown_secs: u64,
    pub pool_keep_alive: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            stream_timeout_secs: 120,
            key_cooldown_secs: 300,
            pool_keep_alive: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub storage_path: String,
    pub context_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage_path: "data/sessions.json".to_string(),
            context_limit: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Substitute `{{VAR}}` / `${VAR}` with process environment values.
/// Unresolvable placeholders are left as-is so the TOML error points at them.
fn interpolate_env(content: &str) -> String {
    ENV_PLACEHOLDER
        .replace_all(content, |caps: &Captures| {
            let var = &caps[2];
            env::var(var).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

pub fn load_single_config(path: &Path) -> Result<AppConfig, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("failed to read config file: {e}"))?;
    let processed = interpolate_env(&content);
    toml::from_str(&processed).map_err(|e| format!("failed to parse config file: {e}"))
}

/// Overlay environment-specific values on top of the base configuration.
/// Provider blocks replace wholesale; scalar sections replace only when the
/// overlay actually customized them.
pub fn merge_app_config(base: AppConfig, overlay: AppConfig) -> AppConfig {
    fn merge_section<T: PartialEq + Default>(base: T, overlay: T) -> T {
        if overlay == T::default() {
            base
        } else {
            overlay
        }
    }

    let mut merged = base;

    if !overlay.llm.default_provider.is_empty()
        && overlay.llm.default_provider != merged.llm.default_provider
    {
        merged.llm.default_provider = overlay.llm.default_provider;
    }
    if let Some(gemini) = overlay.llm.gemini {
        merged.llm.gemini = Some(gemini);
    }
    if let Some(openai) = overlay.llm.openai {
        merged.llm.openai = Some(openai);
    }
    if let Some(vllm) = overlay.llm.vllm {
        merged.llm.vllm = Some(vllm);
    }

    merged.agent = merge_section(merged.agent, overlay.agent);
    merged.gateway = merge_section(merged.gateway, overlay.gateway);
    merged.session = merge_section(merged.session, overlay.session);
    merged
}

/// Load `path`, overlaying `config.<env>.toml` next to it when present.
pub fn load_app_config_with_env(path: &Path, env_name: &str) -> Result<AppConfig, String> {
    let base = load_single_config(path)?;

    let env = env_name.to_lowercase();
    let overlay_path = path.with_file_name(format!("config.{env}.toml"));

    match load_single_config(&overlay_path) {
        Ok(overlay) => Ok(merge_app_config(base, overlay)),
        Err(e) if e.contains("failed to read config file") => Ok(base),
        Err(e) => Err(e),
    }
}

/// Process-scoped configuration holder backing the `/config` endpoint.
pub struct ConfigService {
    path: PathBuf,
    config: RwLock<AppConfig>,
}

impl ConfigService {
    pub fn new(path: PathBuf, config: AppConfig) -> Self {
        Self {
            path,
            config: RwLock::new(config),
        }
    }

    /// Load from disk; a missing or unparsable file starts from defaults.
    pub fn load(path: PathBuf, env_name: &str) -> Self {
        let config = match load_app_config_with_env(&path, env_name) {
            Ok(cfg) => {
                info!(path = %path.display(), env = env_name, "configuration loaded");
                cfg
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config load failed, using defaults");
                AppConfig::default()
            }
        };
        Self::new(path, config)
    }

    pub fn get(&self) -> AppConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    pub fn llm(&self) -> LlmConfig {
        self.get().llm
    }

    pub fn agent(&self) -> AgentConfig {
        self.get().agent
    }

    /// Config as served by GET /config: every credential masked.
    pub fn masked(&self) -> AppConfig {
        let mut cfg = self.get();
        if let Some(gemini) = cfg.llm.gemini.as_mut() {
            gemini.api_key = gemini.api_key.as_deref().map(masked_key);
            gemini.extra_api_keys = gemini.extra_api_keys.iter().map(|k| masked_key(k)).collect();
        }
        if let Some(openai) = cfg.llm.openai.as_mut() {
            openai.api_key = openai.api_key.as_deref().map(masked_key);
        }
        if let Some(vllm) = cfg.llm.vllm.as_mut() {
            vllm.api_key = vllm.api_key.as_deref().map(masked_key);
        }
        cfg
    }

    /// Apply a config write. Incoming masked values (`****…`) keep the
    /// currently stored secret so clients can round-trip GET → POST.
    pub fn update(&self, mut incoming: AppConfig) -> Result<AppConfig, String> {
        {
            let current = self.config.read().expect("config lock poisoned");

            restore_masked(
                incoming.llm.gemini.as_mut().map(|c| &mut c.api_key),
                current.llm.gemini.as_ref().and_then(|c| c.api_key.clone()),
            );
            if let (Some(incoming_gemini), Some(current_gemini)) =
                (incoming.llm.gemini.as_mut(), current.llm.gemini.as_ref())
            {
                for (i, key) in incoming_gemini.extra_api_keys.iter_mut().enumerate() {
                    if key.starts_with(MASK_PREFIX) {
                        if let Some(stored) = current_gemini.extra_api_keys.get(i) {
                            *key = stored.clone();
                        }
                    }
                }
            }
            restore_masked(
                incoming.llm.openai.as_mut().map(|c| &mut c.api_key),
                current.llm.openai.as_ref().and_then(|c| c.api_key.clone()),
            );
            restore_masked(
                incoming.llm.vllm.as_mut().map(|c| &mut c.api_key),
                current.llm.vllm.as_ref().and_then(|c| c.api_key.clone()),
            );
        }

        self.persist(&incoming)?;

        let mut config = self.config.write().expect("config lock poisoned");
        *config = incoming.clone();
        Ok(incoming)
    }

    /// Atomic write: serialize to a sibling temp file, then rename over.
    fn persist(&self, config: &AppConfig) -> Result<(), String> {
        let body =
            toml::to_string_pretty(config).map_err(|e| format!("failed to serialize config: {e}"))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
        }

        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, body).map_err(|e| format!("failed to write config: {e}"))?;
        fs::rename(&tmp, &self.path).map_err(|e| format!("failed to replace config: {e}"))?;
        Ok(())
    }
}

fn restore_masked(incoming: Option<&mut Option<String>>, stored: Option<String>) {
    if let Some(slot) = incoming {
        if let Some(value) = slot.as_deref() {
            if value.starts_with(MASK_PREFIX) {
                *slot = stored;
            }
        }
    }
}
