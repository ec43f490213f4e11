use std::net::{AddrParseError, SocketAddr};

use clap::{Parser, ValueEnum};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "bankd", about = "bankd - retail banking API server")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "bankd.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Storage backend (overrides config file)
    #[arg(short, long, value_enum)]
    pub storage: Option<StorageKind>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub payments: PaymentsConfig,

    #[serde(default)]
    pub loans: LoansConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_session_ttl_minutes")]
    pub session_ttl_minutes: i64,

    #[serde(default = "default_otp_ttl_seconds")]
    pub otp_ttl_seconds: i64,

    #[serde(default = "default_otp_max_attempts")]
    pub otp_max_attempts: u32,

    /// Returns OTP codes in the response body. Development only.
    #[serde(default)]
    pub echo_otp: bool,

    /// Static service keys accepted in `X-API-Key`. They act with the admin role.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,

    /// Admin user created at startup when no user with that email exists.
    #[serde(default)]
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyEntry {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BootstrapAdmin {
    pub email: String,
    pub username: String,
    #[serde(default = "default_admin_name")]
    pub full_name: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_kind")]
    pub backend: StorageKind,

    #[serde(default = "default_storage_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentsConfig {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoansConfig {
    #[serde(default = "default_annual_rate")]
    pub annual_rate: Decimal,

    #[serde(default = "default_max_principal")]
    pub max_principal: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_transaction_amount")]
    pub max_transaction_amount: Decimal,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_session_ttl_minutes() -> i64 {
    60 * 24
}

fn default_otp_ttl_seconds() -> i64 {
    300
}

fn default_otp_max_attempts() -> u32 {
    5
}

fn default_admin_name() -> String {
    "Administrator".to_string()
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Memory
}

fn default_storage_path() -> String {
    "bankd.db".to_string()
}

fn default_settle_delay_ms() -> u64 {
    1500
}

fn default_annual_rate() -> Decimal {
    dec!(0.085)
}

fn default_max_principal() -> Decimal {
    dec!(1000000)
}

fn default_max_transaction_amount() -> Decimal {
    dec!(1000000)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_minutes: default_session_ttl_minutes(),
            otp_ttl_seconds: default_otp_ttl_seconds(),
            otp_max_attempts: default_otp_max_attempts(),
            echo_otp: false,
            api_keys: Vec::new(),
            bootstrap_admin: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_kind(),
            path: default_storage_path(),
        }
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Default for LoansConfig {
    fn default() -> Self {
        Self {
            annual_rate: default_annual_rate(),
            max_principal: default_max_principal(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_transaction_amount: default_max_transaction_amount(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(storage) = cli.storage {
            config.storage.backend = storage;
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.storage.backend, StorageKind::Memory);
        assert_eq!(config.loans.annual_rate, dec!(0.085));
        assert_eq!(config.auth.otp_max_attempts, 5);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::parse(
            r#"
            [server]
            port = 8080

            [storage]
            backend = "sqlite"
            path = "/tmp/bank.db"

            [loans]
            annual_rate = "0.12"

            [[auth.api_keys]]
            name = "ops"
            key = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
        assert_eq!(config.loans.annual_rate, dec!(0.12));
        assert_eq!(config.auth.api_keys[0].name, "ops");
        assert_eq!(config.listen_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs {
            config: "does-not-exist.toml".to_string(),
            port: Some(9000),
            log_level: Some("debug".to_string()),
            storage: Some(StorageKind::Sqlite),
        };
        let config = Config::load(&cli);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::parse(include_str!("../bankd.example.toml")).unwrap();
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
        assert_eq!(config.payments.settle_delay_ms, 1500);
        assert!(config.auth.bootstrap_admin.is_some());
        assert_eq!(config.limits.max_transaction_amount, dec!(1000000));
    }
}
