//! Service configuration, built from environment variables.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::queue::BackoffPolicy;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct OutflowConfig {
    /// SQLite database path.
    pub db_path: String,
    /// Public base URL for tracking and unsubscribe links.
    pub base_url: String,
    /// HTTP listen port.
    pub http_port: u16,
    /// HMAC key for tracking-link signatures.
    pub signing_secret: SecretString,
    /// Shared secret for the inbound webhook.
    pub webhook_token: SecretString,
    /// How often the sequencer rescans active campaigns.
    pub scan_interval: Duration,
    /// Cron expression for the recurring inbox fetch.
    pub reply_fetch_cron: String,
    /// Concurrent consumers for send jobs.
    pub send_concurrency: usize,
    /// Queue poll interval for job consumers.
    pub poll_interval: Duration,
    /// Attempts before a job is routed to the failed state.
    pub max_job_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Mailbox lease TTL.
    pub lock_ttl: Duration,
    /// Mailbox health probe period.
    pub health_check_interval: Duration,
}

fn env_duration_secs(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

impl OutflowConfig {
    /// Build config from environment variables. Only the two secrets are
    /// required; everything else has a sensible default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let signing_secret = std::env::var("OUTFLOW_SIGNING_SECRET")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingEnvVar("OUTFLOW_SIGNING_SECRET".to_string()))?;
        let webhook_token = std::env::var("OUTFLOW_WEBHOOK_TOKEN")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingEnvVar("OUTFLOW_WEBHOOK_TOKEN".to_string()))?;

        let db_path =
            std::env::var("OUTFLOW_DB_PATH").unwrap_or_else(|_| "./data/outflow.db".to_string());

        let http_port: u16 = std::env::var("OUTFLOW_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let base_url = std::env::var("OUTFLOW_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{http_port}"));

        let reply_fetch_cron = std::env::var("OUTFLOW_REPLY_FETCH_CRON")
            .unwrap_or_else(|_| "0 */5 * * * *".to_string());

        let send_concurrency: usize = std::env::var("OUTFLOW_SEND_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let max_job_attempts: u32 = std::env::var("OUTFLOW_MAX_JOB_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        Ok(Self {
            db_path,
            base_url,
            http_port,
            signing_secret,
            webhook_token,
            scan_interval: env_duration_secs("OUTFLOW_SCAN_INTERVAL_SECS", 60),
            reply_fetch_cron,
            send_concurrency,
            poll_interval: env_duration_secs("OUTFLOW_POLL_INTERVAL_SECS", 5),
            max_job_attempts,
            backoff: BackoffPolicy::default(),
            lock_ttl: env_duration_secs("OUTFLOW_LOCK_TTL_SECS", 120),
            health_check_interval: env_duration_secs("OUTFLOW_HEALTH_CHECK_SECS", 900),
        })
    }
}
