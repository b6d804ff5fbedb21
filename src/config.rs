use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::DEFAULT_API_BASE_URL;
use crate::notify::NotifyMode;
use crate::sync::SyncOptions;
use crate::time::{CalendarDate, DEFAULT_TIMEZONE};

pub const DEFAULT_DAYS_COUNT: usize = 30;
pub const MAX_DAYS_COUNT: usize = 60;
pub const MAX_CONCURRENCY: usize = 16;
pub const DEFAULT_CITY_NAME: &str = "Lokasi";

#[derive(Debug, Clone)]
pub struct Config {
    // Location and range; unset values fall back to the resume state
    pub city_id: Option<String>,
    pub city_name: Option<String>,
    pub start_date: Option<CalendarDate>,
    pub days_count: usize,

    /// Civil timezone every date and alarm is evaluated in
    pub timezone: Tz,

    // Upstream
    pub api_base_url: String,
    pub request_timeout_secs: u64,

    // Bulk sync
    pub sync_concurrency: usize,
    pub sync_retry_delay_ms: u64,
    pub sync_deadline_secs: u64,

    pub store_path: PathBuf,

    // Poll loop and alarms
    pub poll_interval_ms: u64,
    pub alarm_window_secs: u32,
    pub reminder_minutes: u32,
    pub mute_minutes: u32,

    // Alert delivery
    pub notify_mode: NotifyMode,
    pub pushover_user_key: Option<String>,
    pub pushover_api_token: Option<String>,
    pub sound_player: Option<String>,
    pub sound_dir: PathBuf,

    // Status HTTP server port (optional, disabled if not set)
    // When set, exposes /health, /ready, /metrics and /mute
    pub status_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing
        Self::from_getter(|key| env::var(key).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Config {
            city_id: non_empty("CITY_ID"),
            city_name: non_empty("CITY_NAME"),
            start_date: non_empty("START_DATE")
                .map(|s| s.parse::<CalendarDate>())
                .transpose()
                .context("START_DATE must be a YYYY-MM-DD date")?,
            days_count: non_empty("DAYS_COUNT")
                .and_then(|s| s.parse().ok())
                .filter(|&d| d > 0)
                .unwrap_or(DEFAULT_DAYS_COUNT),

            timezone: match non_empty("TIMEZONE") {
                Some(name) => name
                    .parse::<Tz>()
                    .map_err(|e| anyhow::anyhow!("{}", e))
                    .with_context(|| format!("TIMEZONE '{}' is not an IANA timezone", name))?,
                None => DEFAULT_TIMEZONE,
            },

            api_base_url: non_empty("API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            request_timeout_secs: non_empty("REQUEST_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(8),

            sync_concurrency: non_empty("SYNC_CONCURRENCY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),
            sync_retry_delay_ms: non_empty("SYNC_RETRY_DELAY_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(900),
            sync_deadline_secs: non_empty("SYNC_DEADLINE_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(600),

            store_path: non_empty("STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./imsakiyah_store.json")),

            poll_interval_ms: non_empty("POLL_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            alarm_window_secs: non_empty("ALARM_WINDOW_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            reminder_minutes: non_empty("REMINDER_MINUTES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
            mute_minutes: non_empty("MUTE_MINUTES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),

            notify_mode: match non_empty("NOTIFY_MODE") {
                Some(mode) => mode
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))
                    .context("NOTIFY_MODE is invalid")?,
                None => NotifyMode::default(),
            },
            pushover_user_key: non_empty("PUSHOVER_USER_KEY"),
            pushover_api_token: non_empty("PUSHOVER_API_TOKEN"),
            sound_player: non_empty("SOUND_PLAYER"),
            sound_dir: non_empty("SOUND_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sounds")),

            status_port: non_empty("STATUS_PORT")
                .map(|s| s.parse::<u16>())
                .transpose()
                .context("STATUS_PORT must be a valid port number")?,
        })
    }

    /// Create config from a HashMap (convenience for testing)
    #[cfg(test)]
    pub fn from_map(map: &HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key).map(|v| v.to_string()))
    }

    /// Validate configuration values at startup.
    /// Returns Ok(()) if all validations pass, or Err with details of what failed.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.sync_concurrency == 0 || self.sync_concurrency > MAX_CONCURRENCY {
            errors.push(format!(
                "SYNC_CONCURRENCY={} out of range (1..={}).",
                self.sync_concurrency, MAX_CONCURRENCY
            ));
        }

        if self.days_count > MAX_DAYS_COUNT {
            errors.push(format!(
                "DAYS_COUNT={} too long (max {}).",
                self.days_count, MAX_DAYS_COUNT
            ));
        }

        if !Self::is_http_url(&self.api_base_url) {
            errors.push(format!(
                "API_BASE_URL '{}' must start with http:// or https://.",
                self.api_base_url
            ));
        }

        if self.request_timeout_secs == 0 {
            errors.push("REQUEST_TIMEOUT_SECS must be greater than 0.".to_string());
        }

        if self.sync_deadline_secs == 0 {
            errors.push("SYNC_DEADLINE_SECS must be greater than 0.".to_string());
        }

        if self.poll_interval_ms == 0 || self.poll_interval_ms > 1000 {
            errors.push(format!(
                "POLL_INTERVAL_MS={} out of range (1..=1000); alarms need at least one poll per second.",
                self.poll_interval_ms
            ));
        }

        if self.alarm_window_secs == 0 || self.alarm_window_secs > 60 {
            errors.push(format!(
                "ALARM_WINDOW_SECS={} out of range (1..=60).",
                self.alarm_window_secs
            ));
        }

        if self.reminder_minutes == 0 || self.reminder_minutes > 180 {
            errors.push(format!(
                "REMINDER_MINUTES={} out of range (1..=180).",
                self.reminder_minutes
            ));
        }

        if self.notify_mode.pushes()
            && (self.pushover_user_key.is_none() || self.pushover_api_token.is_none())
        {
            errors.push(
                "NOTIFY_MODE push/both requires PUSHOVER_USER_KEY and PUSHOVER_API_TOKEN."
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )
        }
    }

    fn is_http_url(url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        ["http://", "https://"]
            .iter()
            .any(|scheme| lower.starts_with(scheme) && lower.len() > scheme.len())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            concurrency: self.sync_concurrency,
            retry_delay: Duration::from_millis(self.sync_retry_delay_ms),
            deadline: Duration::from_secs(self.sync_deadline_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_map(&HashMap::new()).expect("empty env should parse");

        assert_eq!(config.city_id, None);
        assert_eq!(config.start_date, None);
        assert_eq!(config.days_count, 30);
        assert_eq!(config.timezone, chrono_tz::Asia::Jakarta);
        assert_eq!(config.api_base_url, "https://api.myquran.com/v3/sholat");
        assert_eq!(config.sync_concurrency, 4);
        assert_eq!(config.sync_retry_delay_ms, 900);
        assert_eq!(config.sync_deadline_secs, 600);
        assert_eq!(config.request_timeout_secs, 8);
        assert_eq!(config.store_path, PathBuf::from("./imsakiyah_store.json"));
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.alarm_window_secs, 1);
        assert_eq!(config.reminder_minutes, 30);
        assert_eq!(config.mute_minutes, 5);
        assert_eq!(config.notify_mode, NotifyMode::Log);
        assert_eq!(config.sound_player, None);
        assert_eq!(config.sound_dir, PathBuf::from("./sounds"));
        assert_eq!(config.status_port, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_location_and_range() {
        let mut env = HashMap::new();
        env.insert("CITY_ID", "1301");
        env.insert("CITY_NAME", "KOTA JAKARTA");
        env.insert("START_DATE", "2026-02-18");
        env.insert("DAYS_COUNT", "29");
        let config = Config::from_map(&env).expect("should parse");

        assert_eq!(config.city_id.as_deref(), Some("1301"));
        assert_eq!(config.city_name.as_deref(), Some("KOTA JAKARTA"));
        assert_eq!(config.start_date, Some("2026-02-18".parse().unwrap()));
        assert_eq!(config.days_count, 29);
    }

    #[test]
    fn test_blank_values_are_unset() {
        let mut env = HashMap::new();
        env.insert("CITY_ID", "   ");
        env.insert("SOUND_PLAYER", "");
        let config = Config::from_map(&env).expect("should parse");
        assert_eq!(config.city_id, None);
        assert_eq!(config.sound_player, None);
    }

    #[test]
    fn test_bad_days_count_uses_default() {
        for raw in ["abc", "0", "-5"] {
            let mut env = HashMap::new();
            env.insert("DAYS_COUNT", raw);
            let config = Config::from_map(&env).expect("should parse with default");
            assert_eq!(config.days_count, 30, "DAYS_COUNT={}", raw);
        }
    }

    #[test]
    fn test_invalid_start_date() {
        let mut env = HashMap::new();
        env.insert("START_DATE", "18/02/2026");
        let err = Config::from_map(&env).unwrap_err();
        assert!(format!("{:#}", err).contains("START_DATE"), "{:#}", err);
    }

    #[test]
    fn test_timezone() {
        let mut env = HashMap::new();
        env.insert("TIMEZONE", "Asia/Makassar");
        let config = Config::from_map(&env).expect("should parse");
        assert_eq!(config.timezone, chrono_tz::Asia::Makassar);

        env.insert("TIMEZONE", "Mars/Olympus");
        let err = Config::from_map(&env).unwrap_err();
        assert!(format!("{:#}", err).contains("TIMEZONE"), "{:#}", err);
    }

    #[test]
    fn test_notify_mode() {
        let mut env = HashMap::new();
        env.insert("NOTIFY_MODE", "off");
        assert_eq!(Config::from_map(&env).unwrap().notify_mode, NotifyMode::Off);

        env.insert("NOTIFY_MODE", "toast");
        let err = Config::from_map(&env).unwrap_err();
        assert!(format!("{:#}", err).contains("NOTIFY_MODE"), "{:#}", err);
    }

    #[test]
    fn test_invalid_status_port() {
        let mut env = HashMap::new();
        env.insert("STATUS_PORT", "99999");
        let err = Config::from_map(&env).unwrap_err();
        assert!(err.to_string().contains("STATUS_PORT"));

        env.insert("STATUS_PORT", "8080");
        assert_eq!(Config::from_map(&env).unwrap().status_port, Some(8080));
    }

    #[test]
    fn test_validation_push_requires_both_keys() {
        let mut env = HashMap::new();
        env.insert("NOTIFY_MODE", "push");
        env.insert("PUSHOVER_USER_KEY", "user123");
        let config = Config::from_map(&env).expect("should parse");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("PUSHOVER_API_TOKEN"), "{}", err);

        env.insert("PUSHOVER_API_TOKEN", "token456");
        assert!(Config::from_map(&env).unwrap().validate().is_ok());
    }

    #[test]
    fn test_validation_concurrency_range() {
        for (raw, ok) in [("0", false), ("1", true), ("16", true), ("17", false)] {
            let mut env = HashMap::new();
            env.insert("SYNC_CONCURRENCY", raw);
            let config = Config::from_map(&env).expect("should parse");
            assert_eq!(config.validate().is_ok(), ok, "SYNC_CONCURRENCY={}", raw);
        }
    }

    #[test]
    fn test_validation_days_too_long() {
        let mut env = HashMap::new();
        env.insert("DAYS_COUNT", "61");
        let config = Config::from_map(&env).expect("should parse");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("DAYS_COUNT"), "{}", err);
    }

    #[test]
    fn test_validation_base_url() {
        let mut env = HashMap::new();
        env.insert("API_BASE_URL", "ftp://example.com");
        let config = Config::from_map(&env).expect("should parse");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("API_BASE_URL"), "{}", err);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut env = HashMap::new();
        env.insert("SYNC_CONCURRENCY", "0");
        env.insert("POLL_INTERVAL_MS", "5000");
        env.insert("REMINDER_MINUTES", "0");
        let config = Config::from_map(&env).expect("should parse");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("SYNC_CONCURRENCY"));
        assert!(err.contains("POLL_INTERVAL_MS"));
        assert!(err.contains("REMINDER_MINUTES"));
    }

    #[test]
    fn test_sync_options() {
        let mut env = HashMap::new();
        env.insert("SYNC_CONCURRENCY", "2");
        env.insert("SYNC_RETRY_DELAY_MS", "250");
        env.insert("SYNC_DEADLINE_SECS", "60");
        let options = Config::from_map(&env).unwrap().sync_options();
        assert_eq!(options.concurrency, 2);
        assert_eq!(options.retry_delay, Duration::from_millis(250));
        assert_eq!(options.deadline, Duration::from_secs(60));
    }

    #[test]
    fn test_is_http_url() {
        assert!(Config::is_http_url("https://api.myquran.com/v3/sholat"));
        assert!(Config::is_http_url("HTTP://127.0.0.1:8080"));
        assert!(!Config::is_http_url("https://"));
        assert!(!Config::is_http_url("api.myquran.com"));
    }
}
