//! Configuration for the DBSS daemon.
//!
//! Settings come from an optional TOML file and are then overridden by
//! command-line flags. The file also carries the class schema in its
//! `[[class]]` tables.

use clap::Parser;
use dbss_shared::{
    Channel, ClassDef, ClassRegistry, DoId, DoIdRange, SchemaError, CONTROL_CHANNEL,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid class schema: {0}")]
    Schema(#[from] SchemaError),
}

fn default_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_router() -> String {
    "127.0.0.1:7199".to_string()
}

fn default_range_min() -> DoId {
    100_000_000
}

fn default_range_max() -> DoId {
    199_999_999
}

fn default_database() -> Channel {
    4003
}

fn default_load_timeout_ms() -> u64 {
    5000
}

/// Contents of `dbss.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub dbss: DbssSettings,
    #[serde(default, rename = "class")]
    pub classes: Vec<ClassDef>,
}

/// Where the router lives and which local address talks to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_router")]
    pub address: String,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            address: default_router(),
        }
    }
}

/// Owned id range and database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbssSettings {
    /// First owned object id, inclusive.
    #[serde(default = "default_range_min")]
    pub range_min: DoId,
    /// Last owned object id, inclusive.
    #[serde(default = "default_range_max")]
    pub range_max: DoId,
    /// Channel of the database server.
    #[serde(default = "default_database")]
    pub database: Channel,
    /// How long a load may wait for the database before it fails.
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
}

impl Default for DbssSettings {
    fn default() -> Self {
        Self {
            range_min: default_range_min(),
            range_max: default_range_max(),
            database: default_database(),
            load_timeout_ms: default_load_timeout_ms(),
        }
    }
}

/// Command-line flags. Every flag overrides the matching file setting.
#[derive(Parser, Debug, Default)]
#[clap(author, version, about = "Database-backed state server")]
pub struct Args {
    /// Path to the TOML configuration file
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// Local address used to talk to the router
    #[clap(short, long)]
    pub bind: Option<String>,
    /// Router address
    #[clap(short, long)]
    pub router: Option<String>,
    /// Database server channel
    #[clap(short, long)]
    pub database: Option<Channel>,
    /// First owned object id
    #[clap(long)]
    pub range_min: Option<DoId>,
    /// Last owned object id
    #[clap(long)]
    pub range_max: Option<DoId>,
    /// Load timeout in milliseconds
    #[clap(long)]
    pub load_timeout_ms: Option<u64>,
}

/// Validated settings, ready for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub router_address: SocketAddr,
    pub range: DoIdRange,
    pub database: Channel,
    pub load_timeout: Duration,
    pub classes: Arc<ClassRegistry>,
}

impl AppConfig {
    /// Reads and parses a TOML configuration file.
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml(&content)
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads the file named by `--config`, if any, then applies the flags.
    pub async fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load_from_file(path).await?,
            None => Self::default(),
        };
        config.apply_args(args);
        Ok(config)
    }

    /// Overrides file settings with any flags that were given.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(bind) = &args.bind {
            self.router.bind = bind.clone();
        }
        if let Some(router) = &args.router {
            self.router.address = router.clone();
        }
        if let Some(database) = args.database {
            self.dbss.database = database;
        }
        if let Some(min) = args.range_min {
            self.dbss.range_min = min;
        }
        if let Some(max) = args.range_max {
            self.dbss.range_max = max;
        }
        if let Some(timeout) = args.load_timeout_ms {
            self.dbss.load_timeout_ms = timeout;
        }
    }

    /// Checks the settings for consistency and builds the server config.
    pub fn validate(&self) -> Result<ServerConfig, ConfigError> {
        let bind_address = parse_addr("bind", &self.router.bind)?;
        let router_address = parse_addr("router", &self.router.address)?;

        let dbss = &self.dbss;
        if dbss.range_min > dbss.range_max {
            return Err(ConfigError::Invalid(format!(
                "range_min {} is greater than range_max {}",
                dbss.range_min, dbss.range_max
            )));
        }

        let range = DoIdRange::new(dbss.range_min, dbss.range_max);
        if range.owned_channel(CONTROL_CHANNEL).is_some() {
            return Err(ConfigError::Invalid(format!(
                "range {} includes the control channel {}",
                range, CONTROL_CHANNEL
            )));
        }
        if range.owned_channel(dbss.database).is_some() {
            return Err(ConfigError::Invalid(format!(
                "database channel {} is inside the owned range {}",
                dbss.database, range
            )));
        }
        if dbss.load_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "load_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let classes = ClassRegistry::new(self.classes.clone())?;

        Ok(ServerConfig {
            bind_address,
            router_address,
            range,
            database: dbss.database,
            load_timeout: Duration::from_millis(dbss.load_timeout_ms),
            classes: Arc::new(classes),
        })
    }
}

fn parse_addr(name: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid {} address: {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    const SAMPLE: &str = r#"
        [router]
        bind = "127.0.0.1:0"
        address = "127.0.0.1:7199"

        [dbss]
        range_min = 9000
        range_max = 9999
        database = 200

        [[class]]
        id = 5
        name = "DistributedTestObject5"

        [[class.field]]
        id = 1
        name = "setRequired1"
        type = "uint32"
        required = true
        default = 78

        [[class.field]]
        id = 2
        name = "setRDB3"
        type = "uint32"
        required = true
    "#;

    #[test]
    fn test_sample_config() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let server = config.validate().unwrap();

        assert_eq!(server.router_address, "127.0.0.1:7199".parse::<SocketAddr>().unwrap());
        assert_eq!(server.range, DoIdRange::new(9000, 9999));
        assert_eq!(server.database, 200);
        assert_eq!(server.load_timeout, Duration::from_millis(5000));
        assert_eq!(server.classes.len(), 1);

        let class = server.classes.get(5).unwrap();
        assert_eq!(class.required_fields().count(), 2);
        assert_eq!(class.default_value(1).unwrap().as_bytes(), &78u32.to_le_bytes());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        let server = config.validate().unwrap();
        assert_eq!(server.range, DoIdRange::new(100_000_000, 199_999_999));
        assert_eq!(server.database, 4003);
        assert!(server.classes.is_empty());
    }

    #[test]
    fn test_args_override_file() {
        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        let args = Args::try_parse_from([
            "dbss",
            "--router",
            "10.0.0.1:7000",
            "--range-min",
            "9500",
            "--load-timeout-ms",
            "250",
        ])
        .unwrap();
        config.apply_args(&args);

        let server = config.validate().unwrap();
        assert_eq!(server.router_address, "10.0.0.1:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(server.range, DoIdRange::new(9500, 9999));
        assert_eq!(server.database, 200);
        assert_eq!(server.load_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config = AppConfig::default();
        config.dbss.range_min = 10;
        config.dbss.range_max = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_range_with_control_channel_rejected() {
        let mut config = AppConfig::default();
        config.dbss.range_min = 0;
        config.dbss.range_max = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_database_inside_range_rejected() {
        let mut config = AppConfig::default();
        config.dbss.database = u64::from(config.dbss.range_min) + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_address_rejected() {
        let mut config = AppConfig::default();
        config.router.address = "not-an-address".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = AppConfig::default();
        config.dbss.load_timeout_ms = 0;
        assert_err!(config.validate());

        config.dbss.load_timeout_ms = 1;
        assert_ok!(config.validate());
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let mut config = AppConfig::default();
        config.classes = vec![ClassDef::new(5, "A", vec![]), ClassDef::new(5, "B", vec![])];
        assert!(matches!(config.validate(), Err(ConfigError::Schema(_))));
    }

    #[test]
    fn test_bad_toml_is_a_parse_error() {
        assert!(matches!(
            AppConfig::from_toml("[dbss]\nrange_min = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("dbss-config-{}.toml", std::process::id()));
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.dbss.range_min, 9000);
        assert_eq!(config.classes.len(), 1);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_an_io_error() {
        let path = std::env::temp_dir().join("dbss-config-does-not-exist.toml");
        assert!(matches!(
            AppConfig::load_from_file(&path).await,
            Err(ConfigError::Io { .. })
        ));
    }
}
