use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::dispatch::TaskMode;

/// Main configuration structure for the node execution engine
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Execution store backend
    pub store: StoreConfig,
    /// Task dispatch settings
    pub dispatch: DispatchConfig,
    /// Deadline settings
    pub timeout: TimeoutConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON formatted logs
    pub json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Upper bound on concurrently spawned engine pickups
    pub worker_threads_hint: usize,
    pub default_task_mode: TaskMode,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimeoutConfig {
    pub default_timeout_seconds: u64,
}

impl TimeoutConfig {
    /// Deadline applied to nodes armed without an explicit timeout
    pub fn default_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.default_timeout_seconds).unwrap_or(i64::MAX))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                url: "sqlite://node-engine.db".to_string(),
                max_connections: 10,
                auto_migrate: true,
            },
            dispatch: DispatchConfig {
                worker_threads_hint: 16,
                default_task_mode: TaskMode::Async,
            },
            timeout: TimeoutConfig {
                default_timeout_seconds: 600, // 10 minutes
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (node-engine.toml)
    /// 3. Environment variables (prefixed with NODE_ENGINE_)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&EngineConfig::default())?);

        if Path::new("node-engine.toml").exists() {
            builder = builder.add_source(File::with_name("node-engine"));
        }

        // NODE_ENGINE_STORE__MAX_CONNECTIONS=4
        builder = builder.add_source(
            Environment::with_prefix("NODE_ENGINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load a specific file on top of the defaults, ignoring the environment
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = Config::builder()
            .add_source(Config::try_from(&EngineConfig::default())?)
            .add_source(File::from(path))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<EngineConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = EngineConfig::load_env_file();
        EngineConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static EngineConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let config = config()?;
    tracing::info!(
        store_backend = ?config.store.backend,
        default_task_mode = ?config.dispatch.default_task_mode,
        "Configuration loaded successfully"
    );
    Ok(())
}
