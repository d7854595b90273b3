use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the hub
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    pub protocol: ProtocolConfig,
    pub clearing: ClearingConfig,
    pub recovery: RecoveryConfig,
    pub features: FeatureFlags,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// HTTP server configuration
#[derive(Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Bearer token gating privileged operations. When unset they are open,
    /// which is only acceptable behind a trusting gateway.
    pub admin_token: Option<String>,
}

/// Custom Debug that redacts the admin token.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Route finding configuration
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub path_finding_timeout_ms: u64,
    pub max_path_length: u32,
    pub max_paths_per_payment: u32,
}

impl RoutingConfig {
    pub fn path_finding_budget(&self) -> Duration {
        Duration::from_millis(self.path_finding_timeout_ms)
    }
}

/// Two-phase payment protocol configuration
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub prepare_timeout_seconds: u64,
    pub commit_timeout_seconds: u64,
    pub transaction_timeout_seconds: u64,
    pub lock_ttl_seconds: u64,
}

impl ProtocolConfig {
    pub fn prepare_deadline(&self) -> Duration {
        Duration::from_secs(self.prepare_timeout_seconds)
    }

    pub fn commit_deadline(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_seconds)
    }

    pub fn transaction_deadline(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_seconds)
    }
}

/// Clearing engine configuration
#[derive(Debug, Clone)]
pub struct ClearingConfig {
    pub trigger_cycles_max_len: u32,
    pub periodic_cycles_max_len: u32,
    pub max_cycles_per_run: u32,
    pub periodic_interval_min: u64,
}

/// Recovery loop configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval_seconds: u64,
    pub new_grace_seconds: u64,
    pub nonce_retention_hours: u64,
    pub audit_on_start: bool,
}

/// Feature flags
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    /// Widens the path search for benchmarking; the default plan stays the
    /// limited multipath.
    pub full_multipath: bool,
}

/// Default functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> u32 {
    10
}

fn default_path_finding_timeout_ms() -> u64 {
    500
}

fn default_max_path_length() -> u32 {
    6
}

fn default_max_paths_per_payment() -> u32 {
    3
}

fn default_prepare_timeout_seconds() -> u64 {
    3
}

fn default_commit_timeout_seconds() -> u64 {
    5
}

fn default_transaction_timeout_seconds() -> u64 {
    10
}

fn default_lock_ttl_seconds() -> u64 {
    60
}

fn default_trigger_cycles_max_len() -> u32 {
    4
}

fn default_periodic_cycles_max_len() -> u32 {
    6
}

fn default_max_cycles_per_run() -> u32 {
    100
}

fn default_periodic_interval_min() -> u64 {
    60
}

fn default_recovery_interval_seconds() -> u64 {
    5
}

fn default_new_grace_seconds() -> u64 {
    30
}

fn default_nonce_retention_hours() -> u64 {
    24
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
            max_connections: env_or("DB_MAX_CONNECTIONS", default_max_connections()),
        };

        let server = ServerConfig {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| default_bind_address()),
            port: env_or("PORT", default_port()),
            admin_token: env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
        };

        let routing = RoutingConfig {
            path_finding_timeout_ms: env_or(
                "ROUTING_PATH_FINDING_TIMEOUT_MS",
                default_path_finding_timeout_ms(),
            ),
            max_path_length: env_or("ROUTING_MAX_PATH_LENGTH", default_max_path_length()),
            max_paths_per_payment: env_or(
                "ROUTING_MAX_PATHS_PER_PAYMENT",
                default_max_paths_per_payment(),
            ),
        };

        let protocol = ProtocolConfig {
            prepare_timeout_seconds: env_or(
                "PROTOCOL_PREPARE_TIMEOUT_SECONDS",
                default_prepare_timeout_seconds(),
            ),
            commit_timeout_seconds: env_or(
                "PROTOCOL_COMMIT_TIMEOUT_SECONDS",
                default_commit_timeout_seconds(),
            ),
            transaction_timeout_seconds: env_or(
                "PROTOCOL_TRANSACTION_TIMEOUT_SECONDS",
                default_transaction_timeout_seconds(),
            ),
            lock_ttl_seconds: env_or("PROTOCOL_LOCK_TTL_SECONDS", default_lock_ttl_seconds()),
        };

        let clearing = ClearingConfig {
            trigger_cycles_max_len: env_or(
                "CLEARING_TRIGGER_CYCLES_MAX_LEN",
                default_trigger_cycles_max_len(),
            ),
            periodic_cycles_max_len: env_or(
                "CLEARING_PERIODIC_CYCLES_MAX_LEN",
                default_periodic_cycles_max_len(),
            ),
            max_cycles_per_run: env_or("CLEARING_MAX_CYCLES_PER_RUN", default_max_cycles_per_run()),
            periodic_interval_min: env_or(
                "CLEARING_PERIODIC_INTERVAL_MIN",
                default_periodic_interval_min(),
            ),
        };

        let recovery = RecoveryConfig {
            interval_seconds: env_or(
                "RECOVERY_INTERVAL_SECONDS",
                default_recovery_interval_seconds(),
            ),
            new_grace_seconds: env_or("RECOVERY_NEW_GRACE_SECONDS", default_new_grace_seconds()),
            nonce_retention_hours: env_or(
                "NONCE_RETENTION_HOURS",
                default_nonce_retention_hours(),
            ),
            audit_on_start: env_or("AUDIT_ON_START", false),
        };

        let features = FeatureFlags {
            full_multipath: env_or("FEATURE_FULL_MULTIPATH", false),
        };

        let config = Config {
            database,
            server,
            routing,
            protocol,
            clearing,
            recovery,
            features,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(eyre!("database.max_connections must be at least 1"));
        }

        if self.routing.max_path_length < 1 || self.routing.max_path_length > 12 {
            return Err(eyre!("routing.max_path_length must be between 1 and 12"));
        }

        if self.routing.max_paths_per_payment == 0 {
            return Err(eyre!("routing.max_paths_per_payment must be at least 1"));
        }

        if self.routing.path_finding_timeout_ms == 0 {
            return Err(eyre!("routing.path_finding_timeout_ms must be positive"));
        }

        if self.protocol.lock_ttl_seconds == 0 {
            return Err(eyre!("protocol.lock_ttl_seconds must be positive"));
        }

        // A commit that starts after the locks have already expired can never
        // succeed, so the phase deadlines must fit inside the lock TTL.
        if self.protocol.prepare_timeout_seconds + self.protocol.commit_timeout_seconds
            > self.protocol.lock_ttl_seconds
        {
            return Err(eyre!(
                "protocol.lock_ttl_seconds ({}) must cover prepare ({}) + commit ({}) deadlines",
                self.protocol.lock_ttl_seconds,
                self.protocol.prepare_timeout_seconds,
                self.protocol.commit_timeout_seconds
            ));
        }

        if self.clearing.trigger_cycles_max_len < 3 || self.clearing.trigger_cycles_max_len > 4 {
            return Err(eyre!(
                "clearing.trigger_cycles_max_len must be 3 or 4 (SQL discovery covers triangles and quadrilaterals)"
            ));
        }

        if self.clearing.periodic_cycles_max_len < 3 || self.clearing.periodic_cycles_max_len > 8 {
            return Err(eyre!(
                "clearing.periodic_cycles_max_len must be between 3 and 8"
            ));
        }

        if self.clearing.max_cycles_per_run == 0 {
            return Err(eyre!("clearing.max_cycles_per_run must be at least 1"));
        }

        if self.recovery.interval_seconds == 0 {
            return Err(eyre!("recovery.interval_seconds must be positive"));
        }

        Ok(())
    }
}

/// Parse an env var or fall back to the default.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/geo".to_string(),
                max_connections: 10,
            },
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8080,
                admin_token: None,
            },
            routing: RoutingConfig {
                path_finding_timeout_ms: default_path_finding_timeout_ms(),
                max_path_length: default_max_path_length(),
                max_paths_per_payment: default_max_paths_per_payment(),
            },
            protocol: ProtocolConfig {
                prepare_timeout_seconds: default_prepare_timeout_seconds(),
                commit_timeout_seconds: default_commit_timeout_seconds(),
                transaction_timeout_seconds: default_transaction_timeout_seconds(),
                lock_ttl_seconds: default_lock_ttl_seconds(),
            },
            clearing: ClearingConfig {
                trigger_cycles_max_len: default_trigger_cycles_max_len(),
                periodic_cycles_max_len: default_periodic_cycles_max_len(),
                max_cycles_per_run: default_max_cycles_per_run(),
                periodic_interval_min: default_periodic_interval_min(),
            },
            recovery: RecoveryConfig {
                interval_seconds: default_recovery_interval_seconds(),
                new_grace_seconds: default_new_grace_seconds(),
                nonce_retention_hours: default_nonce_retention_hours(),
                audit_on_start: false,
            },
            features: FeatureFlags {
                full_multipath: false,
            },
        }
    }

    #[test]
    fn test_defaults_match_protocol_documentation() {
        assert_eq!(default_path_finding_timeout_ms(), 500);
        assert_eq!(default_max_path_length(), 6);
        assert_eq!(default_max_paths_per_payment(), 3);
        assert_eq!(default_prepare_timeout_seconds(), 3);
        assert_eq!(default_commit_timeout_seconds(), 5);
        assert_eq!(default_transaction_timeout_seconds(), 10);
        assert_eq!(default_lock_ttl_seconds(), 60);
        assert_eq!(default_trigger_cycles_max_len(), 4);
        assert_eq!(default_periodic_cycles_max_len(), 6);
        assert_eq!(default_max_cycles_per_run(), 100);
        assert_eq!(default_periodic_interval_min(), 60);
        assert_eq!(default_recovery_interval_seconds(), 5);
    }

    #[test]
    fn test_default_config_validates() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_empty_database_url_rejected() {
        let mut config = test_config();
        config.database.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_ttl_must_cover_phase_deadlines() {
        let mut config = test_config();
        config.protocol.lock_ttl_seconds = 5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock_ttl_seconds"));
    }

    #[test]
    fn test_path_length_bounds() {
        let mut config = test_config();
        config.routing.max_path_length = 0;
        assert!(config.validate().is_err());
        config.routing.max_path_length = 13;
        assert!(config.validate().is_err());
        config.routing.max_path_length = 6;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_trigger_cycle_length_bounds() {
        let mut config = test_config();
        config.clearing.trigger_cycles_max_len = 5;
        assert!(config.validate().is_err());
        config.clearing.trigger_cycles_max_len = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_debug_is_redacted() {
        let config = test_config();
        let rendered = format!("{:?}", config.database);
        assert!(!rendered.contains("postgres://"));
        assert!(rendered.contains("<redacted>"));
    }
}
