use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A tool as published by its owning server, plus the JSON schema of its
/// parameters. The schema is passed through verbatim here; sanitation for
/// the model happens at prompt-compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-schema-like object: `{type, properties, required}`.
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

fn empty_schema() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReliabilityStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceStats {
    pub avg_latency_ms: f64,
    pub call_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// One registered tool. The owning subprocess session is referenced by
/// `server_id` (an opaque handle into the coordinator's session table),
/// not by pointer. Counters are advisory — nothing trips on them.
#[derive(Debug, Clone)]
pub struct ToolRegistryEntry {
    pub qualified_name: String,
    pub definition: ToolDefinition,
    pub server_id: String,
    pub reliability: ReliabilityStats,
    pub performance: PerformanceStats,
}

/// Merged catalog across all live servers, keyed by qualified name
/// (`<server_id>:<tool_name>`). Single writer (supervisor tasks), many
/// readers; readers get consistent per-call snapshots.
#[derive(Default)]
pub struct ToolRegistry {
    entries: DashMap<String, ToolRegistryEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server's catalog under `server_id:` prefixes.
    /// Returns the number of tools registered.
    pub fn register_server(&self, server_id: &str, tools: Vec<ToolDefinition>) -> usize {
        let mut count = 0;
        for tool in tools {
            let qualified_name = format!("{server_id}:{}", tool.name);
            self.entries.insert(
                qualified_name.clone(),
                ToolRegistryEntry {
                    qualified_name,
                    definition: tool,
                    server_id: server_id.to_string(),
                    reliability: ReliabilityStats::default(),
                    performance: PerformanceStats::default(),
                },
            );
            count += 1;
        }
        count
    }

    /// Drop every entry owned by `server_id`. Returns how many were removed.
    pub fn remove_server(&self, server_id: &str) -> usize {
        let prefix = format!("{server_id}:");
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();
        let count = keys.len();
        for key in keys {
            self.entries.remove(&key);
        }
        if count > 0 {
            debug!(server_id, count, "removed tools from registry");
        }
        count
    }

    /// Resolve a qualified name to (owning server id, bare tool name).
    pub fn resolve(&self, qualified_name: &str) -> Option<(String, String)> {
        self.entries.get(qualified_name).map(|e| {
            (
                e.server_id.clone(),
                e.definition.name.clone(),
            )
        })
    }

    /// Consistent snapshot of the merged catalog.
    pub fn snapshot(&self) -> BTreeMap<String, ToolDefinition> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.definition.clone()))
            .collect()
    }

    pub fn record_success(&self, qualified_name: &str, latency_ms: u64) {
        if let Some(mut entry) = self.entries.get_mut(qualified_name) {
            // average is over successful calls only — failures contribute no latency
            let n = entry.reliability.success_count as f64;
            entry.performance.avg_latency_ms =
                (entry.performance.avg_latency_ms * n + latency_ms as f64) / (n + 1.0);
            entry.reliability.success_count += 1;
            entry.performance.call_count += 1;
            entry.performance.last_used_at = Some(Utc::now());
        }
    }

    pub fn record_failure(&self, qualified_name: &str) {
        if let Some(mut entry) = self.entries.get_mut(qualified_name) {
            entry.reliability.failure_count += 1;
            entry.reliability.last_failure_at = Some(Utc::now());
            entry.performance.call_count += 1;
            entry.performance.last_used_at = Some(Utc::now());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
