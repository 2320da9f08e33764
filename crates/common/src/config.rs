use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-node wall-clock budget when the document does not override it.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Iteration budget per loop node.
pub const MAX_LOOP_ITERATIONS: u32 = 1_000;
/// Recursion budget for nested edge resolution.
pub const MAX_NESTED_DEPTH: usize = 64;
/// Serialized-state budget between nodes.
pub const MAX_STATE_SIZE_BYTES: usize = 10 * 1024 * 1024;
/// Node-invocation budget per execution.
pub const MAX_NODE_EXECUTIONS: u32 = 10_000;
/// How long a finished execution's state stays readable.
pub const STATE_RETENTION_SECS: u64 = 60;

/// Tuning knobs for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub default_timeout_ms: u64,
    pub max_loop_iterations: u32,
    pub max_nested_depth: usize,
    pub max_state_size_bytes: usize,
    pub max_node_executions: u32,
    pub state_retention_secs: u64,
}

impl EngineConfig {
    pub fn state_retention(&self) -> Duration {
        Duration::from_secs(self.state_retention_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: env_or("ENGINE_DEFAULT_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
            max_loop_iterations: env_or("ENGINE_MAX_LOOP_ITERATIONS", MAX_LOOP_ITERATIONS),
            max_nested_depth: env_or("ENGINE_MAX_NESTED_DEPTH", MAX_NESTED_DEPTH),
            max_state_size_bytes: env_or("ENGINE_MAX_STATE_SIZE_BYTES", MAX_STATE_SIZE_BYTES),
            max_node_executions: env_or("ENGINE_MAX_NODE_EXECUTIONS", MAX_NODE_EXECUTIONS),
            state_retention_secs: env_or("ENGINE_STATE_RETENTION_SECS", STATE_RETENTION_SECS),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_caps() {
        let config = EngineConfig::default();
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.max_loop_iterations, 1_000);
        assert_eq!(config.max_nested_depth, 64);
        assert_eq!(config.max_state_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_node_executions, 10_000);
        assert_eq!(config.state_retention().as_secs(), 60);
    }
}
