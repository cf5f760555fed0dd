//! Configuration surface for the job queue crate.
//!
//! Mirrors the reference workspace's per-section config style: small structs
//! with `#[serde(default = "fn")]` fallbacks, a top-level `Config` that nests
//! them, and named presets (`development`, `test`) in addition to `from_env`.

use serde::{Deserialize, Serialize};

/// Top-level configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Assemble configuration from environment variables, falling back to
    /// documented defaults for anything unset.
    ///
    /// Recognized variables: `JOBQUEUE_DATABASE_URL`, `JOBQUEUE_DATABASE_AUTH_TOKEN`,
    /// `JOBQUEUE_WORKER_CONCURRENCY`, `JOBQUEUE_WORKER_POLL_INTERVAL_MS`,
    /// `JOBQUEUE_WORKER_MAX_JOBS`, `JOBQUEUE_WORKER_AUTO_START`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("JOBQUEUE_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(token) = std::env::var("JOBQUEUE_DATABASE_AUTH_TOKEN") {
            config.database.auth_token = Some(token);
        }
        if let Ok(v) = std::env::var("JOBQUEUE_WORKER_CONCURRENCY") {
            if let Ok(v) = v.parse() {
                config.worker_pool.concurrency = v;
            }
        }
        if let Ok(v) = std::env::var("JOBQUEUE_WORKER_POLL_INTERVAL_MS") {
            if let Ok(v) = v.parse() {
                config.worker_pool.poll_interval_ms = v;
            }
        }
        if let Ok(v) = std::env::var("JOBQUEUE_WORKER_MAX_JOBS") {
            if let Ok(v) = v.parse() {
                config.worker_pool.max_jobs = v;
            }
        }
        if let Ok(v) = std::env::var("JOBQUEUE_WORKER_AUTO_START") {
            config.worker_pool.auto_start = matches!(v.as_str(), "1" | "true" | "TRUE" | "yes");
        }

        config
    }

    /// Local development preset: file-backed database, single worker, no auto-start.
    pub fn development() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://jobqueue-dev.db".to_string(),
                auth_token: None,
            },
            worker_pool: WorkerPoolConfig {
                concurrency: 2,
                poll_interval_ms: default_poll_interval_ms(),
                max_jobs: 0,
                auto_start: false,
            },
        }
    }

    /// Test preset: in-memory database, single worker, no auto-start.
    pub fn test() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                auth_token: None,
            },
            worker_pool: WorkerPoolConfig {
                concurrency: 1,
                poll_interval_ms: 10,
                max_jobs: 0,
                auto_start: false,
            },
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.database.url.is_empty() {
            return Err(Error::Config("database.url must not be empty".to_string()));
        }
        if self.worker_pool.concurrency == 0 {
            return Err(Error::Config("worker_pool.concurrency must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Database connectivity options (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL. Accepts `sqlite::memory:`, `sqlite://path/to/file.db`,
    /// or a remote-replica URL understood by a libSQL/Turso-style adapter.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Auth token for remote-replica SQLite services. Not consumed by the
    /// local-file backend shipped here; carried for interface parity.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            auth_token: None,
        }
    }
}

fn default_database_url() -> String {
    "sqlite://jobqueue.db".to_string()
}

/// Worker pool options (§4.3, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of jobs dispatched concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Dispatch tick interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Stop after processing this many jobs. 0 means unbounded.
    #[serde(default)]
    pub max_jobs: u64,

    /// Start dispatching immediately on construction.
    #[serde(default)]
    pub auto_start: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            max_jobs: 0,
            auto_start: false,
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_pool.concurrency, 1);
        assert_eq!(config.worker_pool.poll_interval_ms, 1000);
        assert_eq!(config.worker_pool.max_jobs, 0);
        assert!(!config.worker_pool.auto_start);
    }

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        for var in [
            "JOBQUEUE_DATABASE_URL",
            "JOBQUEUE_DATABASE_AUTH_TOKEN",
            "JOBQUEUE_WORKER_CONCURRENCY",
            "JOBQUEUE_WORKER_POLL_INTERVAL_MS",
            "JOBQUEUE_WORKER_MAX_JOBS",
            "JOBQUEUE_WORKER_AUTO_START",
        ] {
            std::env::remove_var(var);
        }

        let config = Config::from_env();
        assert_eq!(config.database.url, default_database_url());
        assert_eq!(config.worker_pool.concurrency, default_concurrency());
    }

    #[test]
    fn from_env_honors_explicit_overrides() {
        std::env::set_var("JOBQUEUE_WORKER_CONCURRENCY", "7");
        let config = Config::from_env();
        assert_eq!(config.worker_pool.concurrency, 7);
        std::env::remove_var("JOBQUEUE_WORKER_CONCURRENCY");
    }

    #[test]
    fn test_preset_uses_in_memory_database() {
        let config = Config::test();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.worker_pool.concurrency, 1);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = Config::default();
        config.worker_pool.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
