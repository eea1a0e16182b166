use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Result, ToolError};

/// The tool-server config file: `{"servers": {"<server_id>": {...}}}`.
/// Unknown fields (including a redundant per-entry `id`) are tolerated.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolServersFile {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// One tool server entry. Only stdio transport is supported; anything else
/// is skipped with a warning at launch time.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_transport")]
    pub transport: String,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_transport() -> String {
    "stdio".to_string()
}

fn default_timeout_ms() -> u64 {
    valet_core::config::DEFAULT_TOOL_TIMEOUT_MS
}

impl ToolServersFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ToolError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: ToolServersFile = serde_json::from_str(&raw)
            .map_err(|e| ToolError::Config(format!("invalid JSON in {}: {e}", path.display())))?;
        debug!(
            servers = file.servers.len(),
            path = %path.display(),
            "tool server config loaded"
        );
        Ok(file)
    }
}

/// Replace args of the exact shape `${NAME}` with the value of environment
/// variable `NAME`. Missing variables become the empty string with a warning.
/// Substitution is literal — no partial or nested expansion.
pub fn substitute_args(server_id: &str, args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let Some(var_name) = arg
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
            else {
                return arg.clone();
            };
            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    warn!(
                        server_id,
                        var = var_name,
                        "env var not set for arg substitution, using empty string"
                    );
                    String::new()
                }
            }
        })
        .collect()
}
