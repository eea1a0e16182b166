use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Host-wide constants shared by the gateway, orchestrator, and coordinator.
pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_AUTH_PORT: u16 = 8766;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Conversation history cap per session — oldest messages evicted first.
pub const MAX_HISTORY: usize = 50;
/// Deadline for all tool servers to report ready during startup.
pub const SETUP_TIMEOUT_SECS: u64 = 120;
/// Per-call tool timeout when the server config doesn't override it.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 10_000;
/// Model-to-tool round trips allowed within a single user turn.
pub const MAX_TOOL_HOPS: usize = 8;

// WebSocket close codes used across both gateway tiers.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Top-level config (valet.toml + VALET_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValetConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Authorized identities: email -> credentials + persona.
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// When set, the authenticating front tier listens here and bridges
    /// verified clients onto the inner session port.
    pub auth_port: Option<u16>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            auth_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_template_path")]
    pub template_path: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            template_path: default_template_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tools_path")]
    pub config_path: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            config_path: default_tools_path(),
        }
    }
}

/// One authorized identity. The hash is an argon2 PHC string; `persona` is
/// spliced into the `{persona_definition}` placeholder of the base prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub password_hash: Option<String>,
    #[serde(default)]
    pub persona: String,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_template_path() -> String {
    "system_prompt.txt".to_string()
}
fn default_tools_path() -> String {
    "tools.json".to_string()
}

impl ValetConfig {
    /// Load config from a TOML file with VALET_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("valet.toml");

        let config: ValetConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VALET_").split("_"))
            .extract()
            .map_err(|e| crate::error::ValetError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Tool setup deadline in seconds, honouring the VALET_SETUP_TIMEOUT override.
    pub fn setup_timeout_secs() -> u64 {
        std::env::var("VALET_SETUP_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(SETUP_TIMEOUT_SECS)
    }
}
