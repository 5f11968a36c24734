use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::DEFAULT_INITIAL_BALANCE;

/// Main configuration structure for coursehub
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoursehubConfig {
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Account defaults
    pub accounts: AccountsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level or filter directive, e.g. "info" or "coursehub=debug"
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountsConfig {
    /// Cash credited to every new account
    pub initial_balance: u64,
}

impl Default for CoursehubConfig {
    fn default() -> Self {
        Self {
            database: Some(DatabaseConfig {
                url: "sqlite://.coursehub/coursehub.db".to_string(),
                max_connections: 5,
                auto_migrate: true,
            }),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: false,
            },
            accounts: AccountsConfig {
                initial_balance: DEFAULT_INITIAL_BALANCE,
            },
        }
    }
}

impl CoursehubConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (coursehub.toml, .coursehub-rc)
    /// 3. Environment variables (prefixed with COURSEHUB_, sections split by `__`)
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&CoursehubConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        if Path::new("coursehub.toml").exists() {
            builder = builder.add_source(File::with_name("coursehub"));
        }

        if Path::new(".coursehub-rc").exists() {
            builder = builder.add_source(
                File::with_name(".coursehub-rc").format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("COURSEHUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = CoursehubConfig::default();
        assert_eq!(config.accounts.initial_balance, 1000);
        assert_eq!(config.observability.log_level, "info");
        let db = config.database.unwrap();
        assert!(db.auto_migrate);
        assert!(db.url.starts_with("sqlite://"));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coursehub.toml");

        let mut config = CoursehubConfig::default();
        config.accounts.initial_balance = 250;
        config.save_to_file(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: CoursehubConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.accounts.initial_balance, 250);
    }
}
