use anyhow::{Context, Result, bail};
use dotenvy::dotenv;
use secrecy::Secret;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub webhook: WebhookSettings,
    pub usage_warn_threshold: f64,
    pub trial_grace_days: i64,
    pub invoice_due_days: i64,
    pub service_name: String,
    pub log_level: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Clone, Debug)]
pub struct WebhookSettings {
    /// HMAC key shared with the payment service provider.
    pub secret: Secret<String>,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("LICENSING_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("LICENSING_SERVICE_PORT")
            .unwrap_or_else(|_| "3006".to_string())
            .parse()
            .context("LICENSING_SERVICE_PORT must be a valid port number")?;

        let db_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be an integer")?;
        let min_connections = env::var("DATABASE_MIN_CONNECTIONS")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .context("DATABASE_MIN_CONNECTIONS must be an integer")?;

        // A missing webhook secret must hard-fail: accepting unauthenticated
        // provider events is worse than refusing to start.
        let webhook_secret = match env::var("PSP_WEBHOOK_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => bail!("PSP_WEBHOOK_SECRET must be set"),
        };
        let backoff_base_secs = env::var("WEBHOOK_BACKOFF_BASE_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("WEBHOOK_BACKOFF_BASE_SECS must be an integer")?;
        let backoff_cap_secs = env::var("WEBHOOK_BACKOFF_CAP_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .context("WEBHOOK_BACKOFF_CAP_SECS must be an integer")?;

        let usage_warn_threshold = env::var("USAGE_WARN_THRESHOLD")
            .unwrap_or_else(|_| "0.8".to_string())
            .parse()
            .context("USAGE_WARN_THRESHOLD must be a number")?;

        let trial_grace_days = env::var("TRIAL_GRACE_DAYS")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .context("TRIAL_GRACE_DAYS must be an integer")?;
        let invoice_due_days = env::var("INVOICE_DUE_DAYS")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .context("INVOICE_DUE_DAYS must be an integer")?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections,
                min_connections,
            },
            webhook: WebhookSettings {
                secret: Secret::new(webhook_secret),
                backoff_base_secs,
                backoff_cap_secs,
            },
            usage_warn_threshold,
            trial_grace_days,
            invoice_due_days,
            service_name: "licensing-service".to_string(),
            log_level,
        })
    }
}
