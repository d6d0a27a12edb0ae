//! Database connection configuration.
//!
//! A [`DbConfig`] can be built in code, deserialized from the application's
//! configuration tree, or loaded via [`DbConfig::load`] (defaults, optional
//! TOML file, `BEDROCK_*` environment overrides). It is treated as immutable
//! once [`DbConfig::validate`] has accepted it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Connection configuration for one logical database.
///
/// When `url` is set it is authoritative for connecting; the broken-down
/// host/port/credential fields are then only used for admin operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Database name
    pub name: String,
    /// Server host
    pub host: String,
    /// Server port; omitted from synthesized URLs when absent
    pub port: Option<u16>,
    /// URL scheme (`mongodb` or `mongodb+srv`)
    pub protocol: String,
    /// Username for authenticated connections
    pub username: Option<String>,
    /// Password for authenticated connections
    pub password: Option<String>,
    /// Full connection URL; overrides the broken-down fields when present
    pub url: Option<String>,
    /// Permit interactive credential collection on first-run auth failures
    pub admin_prompt: bool,
    /// Treat authentication as required without probing the server
    pub force_authentication: bool,
    /// Extra driver-level authentication mechanism options
    pub authentication: HashMap<String, String>,
    /// Driver-level connect options
    pub connect_options: ConnectOptions,
    /// Write concern applied to the working connection
    pub write_options: WriteOptions,
    /// Server requirements checked during negotiation
    pub requirements: Requirements,
    /// Destructive test-mode setup
    pub drop_collections: DropCollections,
}

/// Driver-level connect options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Enable TLS for the connection
    pub ssl: bool,
    /// Database to authenticate against; defaults to the target database
    pub auth_source: Option<String>,
    /// Replica set name
    pub replica_set: Option<String>,
    /// Server selection timeout in milliseconds
    pub server_selection_timeout_ms: u64,
    /// Connection establishment timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Application name reported to the server
    pub app_name: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            ssl: false,
            auth_source: None,
            replica_set: None,
            server_selection_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            app_name: Some("bedrock".to_string()),
        }
    }
}

/// Write concern settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Acknowledgment mode: `majority`, a node count, or a custom tag
    pub w: String,
    /// Wait for journal durability before acknowledging
    pub journal: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            w: "majority".to_string(),
            journal: true,
        }
    }
}

/// Server requirements checked before the working connection is opened
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    /// Semver range the server version must satisfy
    pub server_version: String,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            server_version: ">=4.4".to_string(),
        }
    }
}

/// Test-mode collection drop, applied during bootstrap only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DropCollections {
    /// Drop the named collections when bootstrap runs in test mode
    pub on_init: bool,
    /// Collections to drop; required when `on_init` is set
    pub collections: Vec<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            name: "bedrock_dev".to_string(),
            host: "localhost".to_string(),
            port: Some(27017),
            protocol: "mongodb".to_string(),
            username: None,
            password: None,
            url: None,
            admin_prompt: true,
            force_authentication: false,
            authentication: HashMap::new(),
            connect_options: ConnectOptions::default(),
            write_options: WriteOptions::default(),
            requirements: Requirements::default(),
            drop_collections: DropCollections::default(),
        }
    }
}

impl DbConfig {
    /// Load configuration from defaults, an optional config file, and
    /// `BEDROCK_*` environment variables (for example
    /// `BEDROCK_CONNECT_OPTIONS__AUTH_SOURCE`).
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder();

        let defaults = config::Config::try_from(&DbConfig::default())
            .map_err(|e| Error::Configuration(format!("invalid defaults: {e}")))?;
        settings = settings.add_source(defaults);

        for path in ["bedrock-db.toml", "config/database.toml"] {
            if std::path::Path::new(path).exists() {
                settings = settings.add_source(config::File::with_name(path));
                break;
            }
        }

        settings = settings.add_source(
            config::Environment::with_prefix("BEDROCK")
                .separator("__")
                .try_parsing(true),
        );

        let config: DbConfig = settings
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Configuration(format!("failed to load configuration: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Cheap and side-effect free; callers may
    /// invoke it repeatedly.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration(
                "database name cannot be empty".to_string(),
            ));
        }
        if self.url.is_none() && self.host.is_empty() {
            return Err(Error::Configuration(
                "either a connection url or a host is required".to_string(),
            ));
        }
        if self.port == Some(0) {
            return Err(Error::Configuration(
                "port must be a positive integer".to_string(),
            ));
        }
        if self.protocol != "mongodb" && self.protocol != "mongodb+srv" {
            return Err(Error::Configuration(format!(
                "unsupported protocol '{}'",
                self.protocol
            )));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::Configuration(
                "a password was configured without a username".to_string(),
            ));
        }
        semver::VersionReq::parse(&self.requirements.server_version).map_err(|e| {
            Error::Configuration(format!(
                "invalid requirements.server_version '{}': {e}",
                self.requirements.server_version
            ))
        })?;
        if self.drop_collections.on_init && self.drop_collections.collections.is_empty() {
            return Err(Error::Configuration(
                "drop_collections.on_init is set but no collections are named".to_string(),
            ));
        }
        Ok(())
    }
}
