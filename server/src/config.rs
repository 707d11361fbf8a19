use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::auth::config::AuthConfig;

/// Top-level server configuration, loaded from inkroom.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub pubsub: PubSubSection,
    pub storage: StorageSection,
    pub auth: AuthSection,
    pub batching: BatchingSection,
    pub hub: HubSection,
    pub sketch: SketchSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub web_address: String,
    /// Deadline applied to every channel-management operation.
    pub operation_timeout_secs: u64,
    /// Origin allowed by CORS. Any origin is allowed when unset.
    pub allowed_origin: Option<String>,
    /// Largest accepted REST request body.
    pub max_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            web_address: "0.0.0.0:8080".into(),
            operation_timeout_secs: 10,
            allowed_origin: None,
            max_body_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:inkroom.db?mode=rwc".into(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PubSubSection {
    /// Redis URL for cross-instance fan-out. When unset, an in-process broker is used.
    pub redis_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub filestore_path: String,
    /// Reserved for an object-store backend; only reported at startup.
    pub aws_region: Option<String>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            filestore_path: "./filestore".into(),
            aws_region: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub secret_key: String,
    pub token_expiry_hours: i64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            token_expiry_hours: 24,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BatchingSection {
    pub queue_capacity: usize,
    pub chat_batch_size: usize,
    pub chat_flush_interval_ms: u64,
    pub sketch_batch_size: usize,
    pub sketch_flush_interval_ms: u64,
}

impl Default for BatchingSection {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            chat_batch_size: 10,
            chat_flush_interval_ms: 1000,
            sketch_batch_size: 10,
            sketch_flush_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub ping_interval_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            ping_interval_secs: 45,
            write_timeout_secs: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SketchSection {
    pub max_per_channel: usize,
    pub max_dimension: u32,
}

impl Default for SketchSection {
    fn default() -> Self {
        Self {
            max_per_channel: 8,
            max_dimension: 4096,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read config file {path}: {e}"))?;
            toml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("failed to parse config file {path}: {e}"))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WEB_ADDRESS") {
            self.server.web_address = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL")
            && !v.is_empty()
        {
            self.pubsub.redis_url = Some(v);
        }
        if let Ok(v) = std::env::var("FILESTORE_PATH") {
            self.storage.filestore_path = v;
        }
        if let Ok(v) = std::env::var("AWS_REGION")
            && !v.is_empty()
        {
            self.storage.aws_region = Some(v);
        }
        if let Ok(v) = std::env::var("SECRET_KEY") {
            self.auth.secret_key = v;
        }
        if let Ok(v) = std::env::var("TOKEN_EXPIRY_HOURS")
            && let Ok(hours) = v.parse()
        {
            self.auth.token_expiry_hours = hours;
        }
        if let Ok(v) = std::env::var("CHAT_BATCH_SIZE")
            && let Ok(size) = v.parse()
        {
            self.batching.chat_batch_size = size;
        }
        if let Ok(v) = std::env::var("SKETCH_BATCH_SIZE")
            && let Ok(size) = v.parse()
        {
            self.batching.sketch_batch_size = size;
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.server.operation_timeout_secs)
    }

    /// Convert into an AuthConfig for the auth layer.
    pub fn to_auth_config(&self) -> AuthConfig {
        AuthConfig {
            secret_key: self.auth.secret_key.clone(),
            token_expiry_hours: self.auth.token_expiry_hours,
        }
    }
}
