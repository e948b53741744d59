//! Process configuration, resolved once at startup from the environment.
//!
//! Request-validation and a general-purpose config-file format are out of
//! scope here; this is the thin struct the rest of the process reads from.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Name or path of the vault CLI binary on `PATH`.
    pub bw_binary: String,
    /// Wall-clock deadline threaded into every step of one pipeline run.
    pub pipeline_deadline: Duration,
    /// Capacity of the scheduler's firing queue.
    pub queue_capacity: usize,
    /// How long `stop()` waits for the worker to drain before giving up.
    pub graceful_stop_timeout: Duration,
    /// Path to the entity store's SQLite file.
    pub store_path: String,
    /// Bind address for the thin HTTP adapter, when the `rest-api` feature is enabled.
    pub http_bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bw_binary: "bw".to_string(),
            pipeline_deadline: Duration::from_secs(5 * 60),
            queue_capacity: 100,
            graceful_stop_timeout: Duration::from_secs(30),
            store_path: "data/vault-backup.db".to_string(),
            http_bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bw_binary: env_or("BW_BINARY", defaults.bw_binary),
            pipeline_deadline: env_secs_or("PIPELINE_DEADLINE_SECS", defaults.pipeline_deadline),
            queue_capacity: env_usize_or("SCHEDULER_QUEUE_CAPACITY", defaults.queue_capacity),
            graceful_stop_timeout: env_secs_or(
                "GRACEFUL_STOP_TIMEOUT_SECS",
                defaults.graceful_stop_timeout,
            ),
            store_path: env_or("STORE_PATH", defaults.store_path),
            http_bind_addr: env_or("HTTP_BIND_ADDR", defaults.http_bind_addr),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_usize_or(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs_or(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.bw_binary, "bw");
        assert_eq!(s.queue_capacity, 100);
        assert_eq!(s.graceful_stop_timeout, Duration::from_secs(30));
    }
}
