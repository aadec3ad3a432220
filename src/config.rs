// config.rs
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{AppError, Result};
use crate::services::escrow::CommissionRate;

const MOMO_SANDBOX_URL: &str = "https://sandbox.momodeveloper.mtn.com";
const MOMO_PRODUCTION_URL: &str = "https://proxy.momoapi.mtn.com";
const ORANGE_SANDBOX_URL: &str = "https://api-s1.orange.cm/sandbox";
const ORANGE_PRODUCTION_URL: &str = "https://api-s1.orange.cm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEnvironment {
    Sandbox,
    Production,
}

impl FromStr for ProviderEnvironment {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(ProviderEnvironment::Sandbox),
            "production" => Ok(ProviderEnvironment::Production),
            other => Err(AppError::configuration(format!(
                "unknown provider environment '{}', expected sandbox or production",
                other
            ))),
        }
    }
}

impl ProviderEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderEnvironment::Sandbox => "sandbox",
            ProviderEnvironment::Production => "production",
        }
    }
}

/// provider_a: MoMo-style collections and disbursements.
#[derive(Debug, Clone)]
pub struct MomoConfig {
    pub environment: ProviderEnvironment,
    pub base_url: String,
    pub api_user: String,
    pub api_key: String,
    pub collection_subscription_key: String,
    pub disbursement_subscription_key: String,
    pub callback_url: String,
    pub webhook_secret: String,
}

impl MomoConfig {
    /// Value of the `X-Target-Environment` header.
    pub fn target_environment(&self) -> &'static str {
        match self.environment {
            ProviderEnvironment::Sandbox => "sandbox",
            ProviderEnvironment::Production => "mtncameroon",
        }
    }
}

/// provider_b: Orange-Money-style web payments and cash-in.
#[derive(Debug, Clone)]
pub struct OrangeConfig {
    pub environment: ProviderEnvironment,
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub channel_user: String,
    pub channel_password: String,
    pub channel_msisdn: String,
    pub pin: String,
    pub callback_url: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub staleness_threshold: Duration,
    pub interval: Duration,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub database_name: String,
    pub provider_a: MomoConfig,
    pub provider_b: OrangeConfig,
    pub commission_rate: CommissionRate,
    pub provider_timeout: Duration,
    pub provider_max_retries: u32,
    pub webhook_tolerance: Duration,
    pub reconciliation: ReconciliationConfig,
    pub identity_service_url: String,
    pub listing_service_url: String,
    pub notification_service_url: String,
}

struct Source<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.optional(name)
            .ok_or_else(|| AppError::configuration(format!("{} must be set", name)))
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.optional(name) {
            Some(raw) => raw
                .parse()
                .map_err(|_| AppError::configuration(format!("{} has an invalid value '{}'", name, raw))),
            None => Ok(default),
        }
    }

    fn seconds(&self, name: &str, default: u64) -> Result<Duration> {
        self.parsed(name, default).map(Duration::from_secs)
    }

    fn base_url(&self, name: &str, environment: ProviderEnvironment, sandbox: &str, production: &str) -> String {
        self.optional(name)
            .unwrap_or_else(|| match environment {
                ProviderEnvironment::Sandbox => sandbox.to_string(),
                ProviderEnvironment::Production => production.to_string(),
            })
            .trim_end_matches('/')
            .to_string()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any key lookup. Missing required keys fail fast.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = Source { lookup };

        let momo_environment: ProviderEnvironment = src.or("MOMO_ENVIRONMENT", "sandbox").parse()?;
        let orange_environment: ProviderEnvironment =
            src.or("ORANGE_ENVIRONMENT", "sandbox").parse()?;

        let provider_a = MomoConfig {
            environment: momo_environment,
            base_url: src.base_url("MOMO_BASE_URL", momo_environment, MOMO_SANDBOX_URL, MOMO_PRODUCTION_URL),
            api_user: src.required("MOMO_API_USER")?,
            api_key: src.required("MOMO_API_KEY")?,
            collection_subscription_key: src.required("MOMO_COLLECTION_SUBSCRIPTION_KEY")?,
            disbursement_subscription_key: src.required("MOMO_DISBURSEMENT_SUBSCRIPTION_KEY")?,
            callback_url: src.required("MOMO_CALLBACK_URL")?,
            webhook_secret: src.required("MOMO_WEBHOOK_SECRET")?,
        };

        let provider_b = OrangeConfig {
            environment: orange_environment,
            base_url: src.base_url(
                "ORANGE_BASE_URL",
                orange_environment,
                ORANGE_SANDBOX_URL,
                ORANGE_PRODUCTION_URL,
            ),
            client_id: src.required("ORANGE_CLIENT_ID")?,
            client_secret: src.required("ORANGE_CLIENT_SECRET")?,
            channel_user: src.required("ORANGE_CHANNEL_USER")?,
            channel_password: src.required("ORANGE_CHANNEL_PASSWORD")?,
            channel_msisdn: src.required("ORANGE_CHANNEL_MSISDN")?,
            pin: src.required("ORANGE_PIN")?,
            callback_url: src.required("ORANGE_CALLBACK_URL")?,
            webhook_secret: src.required("ORANGE_WEBHOOK_SECRET")?,
        };

        let raw_rate: Decimal = src.parsed("COMMISSION_RATE", Decimal::new(5, 2))?;
        let commission_rate = CommissionRate::new(raw_rate)
            .map_err(|e| AppError::configuration(format!("COMMISSION_RATE: {}", e)))?;

        let batch_size: usize = src.parsed("RECONCILE_BATCH_SIZE", 50)?;
        if batch_size == 0 {
            return Err(AppError::configuration("RECONCILE_BATCH_SIZE must be at least 1"));
        }

        let provider_timeout = src.seconds("PROVIDER_TIMEOUT_SECS", 20)?;
        if provider_timeout.is_zero() {
            return Err(AppError::configuration("PROVIDER_TIMEOUT_SECS must be at least 1"));
        }

        let sweep_interval = src.seconds("RECONCILE_INTERVAL_SECS", 30)?;
        if sweep_interval.is_zero() {
            return Err(AppError::configuration("RECONCILE_INTERVAL_SECS must be at least 1"));
        }

        Ok(AppConfig {
            host: src.or("HOST", "0.0.0.0"),
            port: src.parsed("PORT", 3000)?,
            database_url: src.required("DATABASE_URL")?,
            database_name: src.or("DATABASE_NAME", "rent_escrow"),
            provider_a,
            provider_b,
            commission_rate,
            provider_timeout,
            provider_max_retries: src.parsed("PROVIDER_MAX_RETRIES", 1)?,
            webhook_tolerance: src.seconds("WEBHOOK_TOLERANCE_SECS", 300)?,
            reconciliation: ReconciliationConfig {
                staleness_threshold: src.seconds("RECONCILE_STALENESS_SECS", 90)?,
                interval: sweep_interval,
                batch_size,
            },
            identity_service_url: src.required("IDENTITY_SERVICE_URL")?,
            listing_service_url: src.required("LISTING_SERVICE_URL")?,
            notification_service_url: src.required("NOTIFICATION_SERVICE_URL")?,
        })
    }

    pub fn get_config_info(&self) -> serde_json::Value {
        serde_json::json!({
            "provider_a": {
                "environment": self.provider_a.environment.as_str(),
                "base_url": self.provider_a.base_url,
                "callback_url": self.provider_a.callback_url,
                "api_user_set": !self.provider_a.api_user.is_empty(),
            },
            "provider_b": {
                "environment": self.provider_b.environment.as_str(),
                "base_url": self.provider_b.base_url,
                "callback_url": self.provider_b.callback_url,
                "client_id_set": !self.provider_b.client_id.is_empty(),
            },
            "commission_rate": self.commission_rate.value().to_string(),
            "provider_timeout_secs": self.provider_timeout.as_secs(),
            "provider_max_retries": self.provider_max_retries,
            "reconcile_staleness_secs": self.reconciliation.staleness_threshold.as_secs(),
            "reconcile_interval_secs": self.reconciliation.interval.as_secs(),
            "database_name": self.database_name,
            "port": self.port,
            "host": self.host,
        })
    }
}
