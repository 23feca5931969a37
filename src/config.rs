//! Configuration options for fleetdesk

use std::env;
use std::time::Duration;

use crate::error::Error;

/// Environment variable holding the backend project URL
pub const URL_ENV: &str = "FLEETDESK_URL";

/// Environment variable holding the backend API key
pub const KEY_ENV: &str = "FLEETDESK_KEY";

/// Shortest sweep period the scheduler runs with
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Longest reminder window the reminder sweep honours
pub const MAX_REMINDER_WINDOW_DAYS: i64 = 365;

/// Backend credentials, always supplied from the environment
#[derive(Debug, Clone)]
pub struct Credentials {
    /// The base URL of the backend project
    pub url: String,

    /// The API key sent with every request
    pub key: String,
}

impl Credentials {
    /// Read credentials from `FLEETDESK_URL` / `FLEETDESK_KEY`, loading `.env` first
    pub fn from_env() -> Result<Self, Error> {
        dotenv::dotenv().ok();

        let url = env::var(URL_ENV)
            .map_err(|_| Error::validation(format!("{} must be set", URL_ENV)))?;
        let key = env::var(KEY_ENV)
            .map_err(|_| Error::validation(format!("{} must be set", KEY_ENV)))?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            key,
        })
    }
}

/// Configuration options for fleetdesk
#[derive(Debug, Clone)]
pub struct DeskOptions {
    /// The request timeout
    pub request_timeout: Option<Duration>,

    /// The database schema
    pub db_schema: String,

    /// Recorded as `processed_by` / `imported_by` on ledger rows
    pub operator: String,

    /// How often the expiry, reminder and email sweeps run
    pub sweep_interval: Duration,

    /// Days before the POC end date in which a reminder goes out
    pub reminder_window_days: i64,

    /// Duration given to POCs created without one
    pub default_poc_days: i64,

    /// Days added by an extension when none are given
    pub default_extension_days: i64,

    /// Buffered change events per subscriber
    pub change_feed_capacity: usize,

    /// How often the realtime socket sends a heartbeat
    pub heartbeat_interval: Duration,

    /// First delay before reconnecting a dropped realtime socket
    pub reconnect_interval: Duration,

    /// Upper bound for the reconnect delay as it backs off
    pub max_reconnect_interval: Duration,
}

impl Default for DeskOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            db_schema: "public".to_string(),
            operator: "admin".to_string(),
            sweep_interval: Duration::from_secs(5 * 60),
            reminder_window_days: 7,
            default_poc_days: 30,
            default_extension_days: 30,
            change_feed_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
        }
    }
}

impl DeskOptions {
    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    /// Set the database schema
    pub fn with_db_schema(mut self, value: &str) -> Self {
        self.db_schema = value.to_string();
        self
    }

    /// Set the operator recorded on ledger rows
    pub fn with_operator(mut self, value: &str) -> Self {
        self.operator = value.to_string();
        self
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, value: Duration) -> Self {
        self.sweep_interval = value.max(MIN_SWEEP_INTERVAL);
        self
    }

    /// Set the reminder window
    pub fn with_reminder_window_days(mut self, value: i64) -> Self {
        self.reminder_window_days = value.clamp(0, MAX_REMINDER_WINDOW_DAYS);
        self
    }

    /// Set the default POC duration
    pub fn with_default_poc_days(mut self, value: i64) -> Self {
        self.default_poc_days = value;
        self
    }

    /// Set the default extension length
    pub fn with_default_extension_days(mut self, value: i64) -> Self {
        self.default_extension_days = value;
        self
    }

    /// Set the change feed capacity
    pub fn with_change_feed_capacity(mut self, value: usize) -> Self {
        self.change_feed_capacity = value.max(1);
        self
    }

    /// Set the realtime heartbeat interval
    pub fn with_heartbeat_interval(mut self, value: Duration) -> Self {
        self.heartbeat_interval = value.max(MIN_SWEEP_INTERVAL);
        self
    }

    /// Set the initial and maximum realtime reconnect delays
    pub fn with_reconnect_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_interval = initial.max(MIN_SWEEP_INTERVAL);
        self.max_reconnect_interval = max.max(self.reconnect_interval);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_single_sweep_cadence() {
        let options = DeskOptions::default();
        assert_eq!(options.sweep_interval, Duration::from_secs(300));
        assert_eq!(options.reminder_window_days, 7);
        assert_eq!(options.default_extension_days, 30);
    }

    #[test]
    fn test_builder() {
        let options = DeskOptions::default()
            .with_operator("ops@example.com")
            .with_change_feed_capacity(0);
        assert_eq!(options.operator, "ops@example.com");
        assert_eq!(options.change_feed_capacity, 1);
    }

    #[test]
    fn test_builder_clamps_sweep_settings() {
        let options = DeskOptions::default()
            .with_sweep_interval(Duration::ZERO)
            .with_reminder_window_days(i64::MAX);
        assert_eq!(options.sweep_interval, MIN_SWEEP_INTERVAL);
        assert_eq!(options.reminder_window_days, 365);
    }
}
