use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::matcher::TieBreak;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}, expected compact/json")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub dispatch_queue_size: usize,
    pub event_buffer_size: usize,
    pub default_delivery_radius_m: f64,
    pub max_candidates: usize,
    pub tie_break: TieBreak,
    pub reservation_timeout: Duration,
    pub candidate_query_timeout: Duration,
    pub notify_timeout: Duration,
    pub max_cas_retries: u32,
    pub auto_dispatch_on_prepared: bool,
    pub dispatch_concurrency: usize,
    pub redispatch_delay: Duration,
    pub max_redispatch_attempts: u32,
    pub reconcile_interval: Duration,
    pub stale_reservation: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            dispatch_queue_size: 1024,
            event_buffer_size: 1024,
            default_delivery_radius_m: 5_000.0,
            max_candidates: 10,
            tie_break: TieBreak::MostRecentlyActive,
            reservation_timeout: Duration::from_millis(2_000),
            candidate_query_timeout: Duration::from_millis(2_000),
            notify_timeout: Duration::from_millis(1_000),
            max_cas_retries: 5,
            auto_dispatch_on_prepared: true,
            dispatch_concurrency: 32,
            redispatch_delay: Duration::from_millis(5_000),
            max_redispatch_attempts: 3,
            reconcile_interval: Duration::from_secs(30),
            stale_reservation: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse_or_default("LOG_FORMAT", defaults.log_format)?,
            dispatch_queue_size: parse_or_default("DISPATCH_QUEUE_SIZE", defaults.dispatch_queue_size)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            default_delivery_radius_m: parse_or_default(
                "DEFAULT_DELIVERY_RADIUS_M",
                defaults.default_delivery_radius_m,
            )?,
            max_candidates: parse_or_default("MAX_CANDIDATES", defaults.max_candidates)?,
            tie_break: parse_or_default("MATCH_TIE_BREAK", defaults.tie_break)?,
            reservation_timeout: millis_or_default("RESERVATION_TIMEOUT_MS", defaults.reservation_timeout)?,
            candidate_query_timeout: millis_or_default(
                "CANDIDATE_QUERY_TIMEOUT_MS",
                defaults.candidate_query_timeout,
            )?,
            notify_timeout: millis_or_default("NOTIFY_TIMEOUT_MS", defaults.notify_timeout)?,
            max_cas_retries: parse_or_default("MAX_CAS_RETRIES", defaults.max_cas_retries)?,
            auto_dispatch_on_prepared: parse_or_default(
                "AUTO_DISPATCH_ON_PREPARED",
                defaults.auto_dispatch_on_prepared,
            )?,
            dispatch_concurrency: parse_or_default("DISPATCH_CONCURRENCY", defaults.dispatch_concurrency)?,
            redispatch_delay: millis_or_default("REDISPATCH_DELAY_MS", defaults.redispatch_delay)?,
            max_redispatch_attempts: parse_or_default(
                "MAX_REDISPATCH_ATTEMPTS",
                defaults.max_redispatch_attempts,
            )?,
            reconcile_interval: secs_or_default("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval)?,
            stale_reservation: secs_or_default("STALE_RESERVATION_SECS", defaults.stale_reservation)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(self.default_delivery_radius_m.is_finite() && self.default_delivery_radius_m > 0.0) {
            return Err(AppError::Internal(
                "DEFAULT_DELIVERY_RADIUS_M must be a positive number".to_string(),
            ));
        }
        if self.max_candidates == 0 {
            return Err(AppError::Internal("MAX_CANDIDATES must be > 0".to_string()));
        }
        if self.dispatch_concurrency == 0 || self.dispatch_queue_size == 0 {
            return Err(AppError::Internal(
                "DISPATCH_CONCURRENCY and DISPATCH_QUEUE_SIZE must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| AppError::Internal(format!("invalid {key}: {err}")))
}

fn millis_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    match env::var(key) {
        Ok(raw) => parse_value::<u64>(key, &raw).map(Duration::from_millis),
        Err(_) => Ok(default),
    }
}

fn secs_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    match env::var(key) {
        Ok(raw) => parse_value::<u64>(key, &raw).map(Duration::from_secs),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_value, Config, LogFormat};
    use crate::engine::matcher::TieBreak;

    #[test]
    fn parses_typed_values() {
        assert_eq!(parse_value::<u16>("HTTP_PORT", " 8080 ").unwrap(), 8080);
        assert!(!parse_value::<bool>("AUTO_DISPATCH_ON_PREPARED", "false").unwrap());
        assert_eq!(parse_value::<LogFormat>("LOG_FORMAT", "JSON").unwrap(), LogFormat::Json);
        assert_eq!(
            parse_value::<TieBreak>("MATCH_TIE_BREAK", "driver_id").unwrap(),
            TieBreak::DriverId
        );
    }

    #[test]
    fn reports_key_on_invalid_value() {
        let err = parse_value::<u16>("HTTP_PORT", "eighty").unwrap_err();
        assert!(err.to_string().contains("HTTP_PORT"));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_radius() {
        let config = Config {
            default_delivery_radius_m: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
