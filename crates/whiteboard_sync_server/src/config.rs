use std::env;
use std::time::Duration;
use whiteboard_sync::RoomSettings;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// Coalescing window for room document writes (default: 2000 ms)
    pub persist_interval: Duration,
    /// How often every live room is asked for its daily backup (default: 3600 s)
    pub backup_sweep_interval: Duration,
    /// How often idle rooms are evicted (default: 300 s)
    pub room_idle_sweep: Duration,
    /// Request body limit in bytes (default: 16 MiB)
    pub max_payload_bytes: usize,
    /// Shared secret required on every request when set
    pub access_token: Option<String>,
    /// R2 blob storage configuration
    pub r2: R2Config,
}

/// R2 blob storage configuration.
#[derive(Debug, Clone)]
pub struct R2Config {
    /// Bucket name (default: whiteboard-rooms)
    pub bucket: String,
    /// Cloudflare account ID
    pub account_id: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Optional endpoint override
    pub endpoint: Option<String>,
    /// Object key prefix (default: whiteboard-sync)
    pub prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            cors_origins: Vec::new(),
            persist_interval: Duration::from_millis(2000),
            backup_sweep_interval: Duration::from_secs(3600),
            room_idle_sweep: Duration::from_secs(300),
            max_payload_bytes: 16 * 1024 * 1024,
            access_token: None,
            r2: R2Config {
                bucket: "whiteboard-rooms".to_string(),
                account_id: String::new(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
                endpoint: None,
                prefix: "whiteboard-sync".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let persist_interval = Duration::from_millis(number_var(
            "PERSIST_INTERVAL_MS",
            defaults.persist_interval.as_millis() as u64,
        )?);
        let backup_sweep_interval = Duration::from_secs(number_var(
            "BACKUP_SWEEP_INTERVAL_SECS",
            defaults.backup_sweep_interval.as_secs(),
        )?);
        let room_idle_sweep = Duration::from_secs(number_var(
            "ROOM_IDLE_SWEEP_SECS",
            defaults.room_idle_sweep.as_secs(),
        )?);
        let max_payload_bytes =
            number_var("MAX_PAYLOAD_BYTES", defaults.max_payload_bytes as u64)? as usize;

        let access_token = env::var("ACCESS_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let r2 = R2Config {
            bucket: env::var("R2_BUCKET").unwrap_or(defaults.r2.bucket),
            account_id: env::var("R2_ACCOUNT_ID").unwrap_or_default(),
            access_key_id: env::var("R2_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: env::var("R2_SECRET_ACCESS_KEY").unwrap_or_default(),
            endpoint: env::var("R2_ENDPOINT")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            prefix: env::var("R2_PREFIX").unwrap_or(defaults.r2.prefix),
        };

        Ok(Config {
            host,
            port,
            cors_origins,
            persist_interval,
            backup_sweep_interval,
            room_idle_sweep,
            max_payload_bytes,
            access_token,
            r2,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if R2 credentials are configured.
    pub fn is_r2_configured(&self) -> bool {
        !self.r2.account_id.is_empty()
            && !self.r2.access_key_id.is_empty()
            && !self.r2.secret_access_key.is_empty()
    }

    /// Settings handed to every room actor.
    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            persist_interval: self.persist_interval,
        }
    }
}

/// Parse a numeric variable, falling back to `default` when unset.
fn number_var(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidNumber(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidNumber(name) => {
                write!(f, "Invalid {} environment variable", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
