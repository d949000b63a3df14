//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
    /// Local accounts created at startup when missing
    #[serde(default)]
    pub accounts: Vec<LocalAccountConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain, optionally with port (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation settings shared by inbound and outbound paths
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Origins (`host[:port]`) whose traffic is acknowledged and dropped
    #[serde(default)]
    pub blocked_origins: Vec<String>,
    #[serde(default)]
    pub bridge: BridgeConfig,
    pub delivery: DeliveryConfig,
    /// Permit fetching and delivering to loopback/private addresses.
    ///
    /// Only meant for development setups where peers run on localhost.
    #[serde(default)]
    pub allow_private_addresses: bool,
}

/// Trusted bridge gateway
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Shared bearer token presented by the bridge
    pub token: Option<String>,
    /// CIDR networks the bridge may connect from; empty means any address
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

/// Outbound delivery tuning
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Concurrent deliveries in flight
    pub max_concurrency: usize,
    /// Per-attempt timeout
    pub timeout_seconds: u64,
    /// Attempts per target, including the first one
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts
    pub base_backoff_millis: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            timeout_seconds: 10,
            max_attempts: 3,
            base_backoff_millis: 500,
        }
    }
}

/// Local account ensured at startup
#[derive(Debug, Clone, Deserialize)]
pub struct LocalAccountConfig {
    pub username: String,
    pub display_name: Option<String>,
    /// Follow requests need manual approval
    #[serde(default)]
    pub locked: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (LAGOON__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost:8080")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/lagoon.db")?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("federation.bridge.enabled", false)?
            .set_default("federation.delivery.max_concurrency", 10)?
            .set_default("federation.delivery.timeout_seconds", 10)?
            .set_default("federation.delivery.max_attempts", 3)?
            .set_default("federation.delivery.base_backoff_millis", 500)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (LAGOON__*)
            .add_source(
                Environment::with_prefix("LAGOON")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("federation.blocked_origins")
                    .with_list_parse_key("federation.bridge.allowed_ips")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        if is_local_server_domain(&self.server.domain) {
            let host = normalized_server_host(&self.server.domain);
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                tracing::warn!(
                    host = %host,
                    protocol = %self.server.protocol,
                    "Serving federation documents over plain http for local development"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        let bridge = &self.federation.bridge;
        if bridge.enabled
            && bridge
                .token
                .as_deref()
                .is_none_or(|token| token.trim().is_empty())
        {
            return Err(crate::error::AppError::Config(
                "federation.bridge.token is required when the bridge is enabled".to_string(),
            ));
        }
        for network in &bridge.allowed_ips {
            network.parse::<ipnetwork::IpNetwork>().map_err(|e| {
                crate::error::AppError::Config(format!(
                    "federation.bridge.allowed_ips entry {network:?} is invalid: {e}"
                ))
            })?;
        }

        let delivery = &self.federation.delivery;
        if delivery.max_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery.max_concurrency must be greater than 0".to_string(),
            ));
        }
        if delivery.max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery.max_attempts must be greater than 0".to_string(),
            ));
        }
        if delivery.timeout_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        for account in &self.accounts {
            if !is_valid_username(&account.username) {
                return Err(crate::error::AppError::Config(format!(
                    "accounts entry {:?} is not a valid username",
                    account.username
                )));
            }
        }

        Ok(())
    }
}

/// Lowercase ASCII letters, digits and underscores
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
