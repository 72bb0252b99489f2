use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{CardError, CardResult};
use crate::ledger::MAX_JOURNAL_CAPACITY;

const ENV_ENVIRONMENT: &str = "ZEREANS_ENVIRONMENT";
const ENV_STARTING_BALANCE: &str = "ZEREANS_STARTING_BALANCE";
const ENV_MAX_TRANSACTION_AMOUNT: &str = "ZEREANS_MAX_TRANSACTION_AMOUNT";
const ENV_JOURNAL_CAPACITY: &str = "ZEREANS_JOURNAL_CAPACITY";
const ENV_REQUIRE_CLASS_ZERO: &str = "ZEREANS_REQUIRE_CLASS_ZERO";
const ENV_LOG_LEVEL: &str = "ZEREANS_LOG_LEVEL";

pub const DEFAULT_STARTING_BALANCE: i16 = 1000;
pub const DEFAULT_MAX_TRANSACTION_AMOUNT: i16 = 10_000;
pub const DEFAULT_JOURNAL_CAPACITY: usize = 16;

/// Deployment environment the card runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    /// Unknown names fall back to development.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "test" | "testing" => Environment::Test,
            _ => Environment::Development,
        }
    }

    fn default_log_level(self) -> &'static str {
        match self {
            Environment::Production => "INFO",
            Environment::Development => "DEBUG",
            Environment::Test => "WARN",
        }
    }
}

/// Card configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardConfig {
    pub starting_balance: i16,
    pub max_transaction_amount: i16,
    pub journal_capacity: usize,
    pub require_class_zero: bool,
    pub environment: Environment,
    pub log_level: String,
}

impl CardConfig {
    pub fn new(environment: Environment) -> Self {
        Self {
            starting_balance: DEFAULT_STARTING_BALANCE,
            max_transaction_amount: DEFAULT_MAX_TRANSACTION_AMOUNT,
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            require_class_zero: true,
            environment,
            log_level: environment.default_log_level().to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> CardResult<Self> {
        let environment = std::env::var(ENV_ENVIRONMENT)
            .map(|name| Environment::parse(&name))
            .unwrap_or(Environment::Development);

        let mut config = Self::new(environment);
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        log::info!("Card configuration loaded for {:?} environment", environment);
        Ok(config)
    }

    /// Apply `ZEREANS_*` overrides supplied by `lookup`.
    ///
    /// Empty values and values with control characters are ignored with a
    /// warning; values that fail to parse are an error.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> CardResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let accepted = |name: &str| -> Option<String> {
            let value = lookup(name)?;
            if value.trim().is_empty() {
                log::warn!("Environment variable {} is empty", name);
                return None;
            }
            if value.chars().any(|c| c.is_control()) {
                log::warn!(
                    "Environment variable {} contains control characters, ignoring",
                    name
                );
                return None;
            }
            log::debug!("Loaded configuration override from {}", name);
            Some(value)
        };

        if let Some(value) = accepted(ENV_STARTING_BALANCE) {
            self.starting_balance = parse_number(&value, ENV_STARTING_BALANCE)?;
        }
        if let Some(value) = accepted(ENV_MAX_TRANSACTION_AMOUNT) {
            self.max_transaction_amount = parse_number(&value, ENV_MAX_TRANSACTION_AMOUNT)?;
        }
        if let Some(value) = accepted(ENV_JOURNAL_CAPACITY) {
            self.journal_capacity = parse_number(&value, ENV_JOURNAL_CAPACITY)?;
        }
        if let Some(value) = accepted(ENV_REQUIRE_CLASS_ZERO) {
            self.require_class_zero = parse_bool_flag(&value, ENV_REQUIRE_CLASS_ZERO)?;
        }
        if let Some(value) = accepted(ENV_LOG_LEVEL) {
            self.log_level = value.trim().to_uppercase();
        }

        Ok(())
    }

    pub fn validate(&self) -> CardResult<()> {
        if self.starting_balance < 0 {
            return Err(CardError::ConfigError(format!(
                "starting_balance must not be negative, got {}",
                self.starting_balance
            )));
        }
        if self.max_transaction_amount <= 0 {
            return Err(CardError::ConfigError(format!(
                "max_transaction_amount must be positive, got {}",
                self.max_transaction_amount
            )));
        }
        self.log_filter()?;
        if self.journal_capacity == 0 || self.journal_capacity > MAX_JOURNAL_CAPACITY {
            return Err(CardError::ConfigError(format!(
                "journal_capacity must be within 1..={}, got {}",
                MAX_JOURNAL_CAPACITY, self.journal_capacity
            )));
        }
        Ok(())
    }

    /// `log_level` as a filter for `log::set_max_level`.
    pub fn log_filter(&self) -> CardResult<log::LevelFilter> {
        log::LevelFilter::from_str(self.log_level.trim()).map_err(|_| {
            CardError::ConfigError(format!("Unknown log level '{}'", self.log_level))
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

impl Default for CardConfig {
    fn default() -> Self {
        Self::new(Environment::Development)
    }
}

fn parse_bool_flag(value: &str, key: &str) -> CardResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(CardError::ConfigError(format!(
            "Invalid boolean value '{}' for key '{}'",
            value, key
        ))),
    }
}

fn parse_number<T: FromStr>(value: &str, key: &str) -> CardResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        CardError::ConfigError(format!(
            "Invalid numeric value '{}' for key '{}'",
            value, key
        ))
    })
}
