//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub billing: BillingConfig,
    pub payout: PayoutConfig,
    pub reconciliation: ReconciliationConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `None` runs the service on the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64, // seconds
    pub idle_timeout: u64,       // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// How much a payment-gated plan upgrade charges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeChargePolicy {
    /// The full monthly price of the target plan.
    FullPrice,
    /// Target price minus the current price.
    Delta,
}

impl FromStr for UpgradeChargePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "full_price" => Ok(UpgradeChargePolicy::FullPrice),
            "delta" => Ok(UpgradeChargePolicy::Delta),
            _ => Err(ConfigError::InvalidValue(
                "UPGRADE_CHARGE_POLICY must be full_price or delta".to_string(),
            )),
        }
    }
}

/// Subscription plan billing
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub currency: String,
    pub cycle_days: i64,
    pub upgrade_charge_policy: UpgradeChargePolicy,
    /// Commission taken from sales of sellers on the percentage model.
    pub percentage_commission_rate: Decimal,
    /// Commission taken from sales of sellers on a subscription plan.
    pub subscription_commission_rate: Decimal,
    pub cycle_poll_interval: Duration,
}

/// Seller withdrawals
#[derive(Debug, Clone)]
pub struct PayoutConfig {
    pub currency: String,
    pub withdrawal_fee_rate: Decimal,
    pub min_withdrawal_amount: i64,
}

/// Background status sweep for rows stuck in pending/processing
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub batch_size: i64,
}

fn parse_var<T: FromStr>(name: &str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string()))
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            billing: BillingConfig::from_env()?,
            payout: PayoutConfig::from_env()?,
            reconciliation: ReconciliationConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.logging.validate()?;
        self.billing.validate()?;
        self.payout.validate()?;
        self.reconciliation.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("SERVER_PORT", "8000")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            min_connections: parse_var("DB_MIN_CONNECTIONS", "5")?,
            connection_timeout: parse_var("DB_CONNECTION_TIMEOUT", "30")?,
            idle_timeout: parse_var("DB_IDLE_TIMEOUT", "600")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(ConfigError::InvalidValue(
                    "DATABASE_URL must be a postgres:// URL".to_string(),
                ));
            }
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            currency: "TZS".to_string(),
            cycle_days: 30,
            upgrade_charge_policy: UpgradeChargePolicy::FullPrice,
            percentage_commission_rate: Decimal::new(10, 2),
            subscription_commission_rate: Decimal::ZERO,
            cycle_poll_interval: Duration::from_secs(300),
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(BillingConfig {
            currency: env::var("BILLING_CURRENCY").unwrap_or_else(|_| "TZS".to_string()),
            cycle_days: parse_var("BILLING_CYCLE_DAYS", "30")?,
            upgrade_charge_policy: parse_var("UPGRADE_CHARGE_POLICY", "full_price")?,
            percentage_commission_rate: parse_var("PERCENTAGE_COMMISSION_RATE", "0.10")?,
            subscription_commission_rate: parse_var("SUBSCRIPTION_COMMISSION_RATE", "0")?,
            cycle_poll_interval: Duration::from_secs(parse_var(
                "BILLING_CYCLE_POLL_INTERVAL_SECONDS",
                "300",
            )?),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_days <= 0 {
            return Err(ConfigError::InvalidValue("BILLING_CYCLE_DAYS".to_string()));
        }

        for (name, rate) in [
            ("PERCENTAGE_COMMISSION_RATE", self.percentage_commission_rate),
            ("SUBSCRIPTION_COMMISSION_RATE", self.subscription_commission_rate),
        ] {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be in [0, 1)",
                    name
                )));
            }
        }

        Ok(())
    }
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            currency: "TZS".to_string(),
            withdrawal_fee_rate: Decimal::new(2, 2),
            min_withdrawal_amount: 1_000,
        }
    }
}

impl PayoutConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(PayoutConfig {
            currency: env::var("PAYOUT_CURRENCY").unwrap_or_else(|_| "TZS".to_string()),
            withdrawal_fee_rate: parse_var("WITHDRAWAL_FEE_RATE", "0.02")?,
            min_withdrawal_amount: parse_var("MIN_WITHDRAWAL_AMOUNT", "1000")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.withdrawal_fee_rate < Decimal::ZERO || self.withdrawal_fee_rate >= Decimal::ONE {
            return Err(ConfigError::ValidationFailed(
                "WITHDRAWAL_FEE_RATE must be in [0, 1)".to_string(),
            ));
        }

        if self.min_withdrawal_amount <= 0 {
            return Err(ConfigError::InvalidValue("MIN_WITHDRAWAL_AMOUNT".to_string()));
        }

        Ok(())
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            batch_size: 100,
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ReconciliationConfig {
            poll_interval: Duration::from_secs(parse_var("RECONCILE_POLL_INTERVAL_SECONDS", "60")?),
            stale_after: Duration::from_secs(parse_var("RECONCILE_STALE_AFTER_SECONDS", "300")?),
            batch_size: parse_var("RECONCILE_BATCH_SIZE", "100")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "RECONCILE_POLL_INTERVAL_SECONDS".to_string(),
            ));
        }

        if self.batch_size <= 0 {
            return Err(ConfigError::InvalidValue("RECONCILE_BATCH_SIZE".to_string()));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Invalid port
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_url_is_optional() {
        let config = DatabaseConfig {
            url: None,
            max_connections: 10,
            min_connections: 1,
            connection_timeout: 30,
            idle_timeout: 600,
        };
        assert!(config.validate().is_ok());

        let config = DatabaseConfig {
            url: Some("mysql://nope".to_string()),
            ..config
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_billing_defaults() {
        let config = BillingConfig::default();
        assert_eq!(config.upgrade_charge_policy, UpgradeChargePolicy::FullPrice);
        assert_eq!(config.percentage_commission_rate, Decimal::new(10, 2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_upgrade_policy_parsing() {
        assert_eq!(
            UpgradeChargePolicy::from_str("delta").ok(),
            Some(UpgradeChargePolicy::Delta)
        );
        assert!(UpgradeChargePolicy::from_str("half").is_err());
    }

    #[test]
    fn test_fee_rate_must_be_a_fraction() {
        let config = PayoutConfig {
            withdrawal_fee_rate: Decimal::ONE,
            ..PayoutConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
