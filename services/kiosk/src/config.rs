use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Realtime transport endpoint.
    pub ws_url: String,
    /// Session directory and history API.
    pub http_base: String,
    /// Task listing/todo/abort API; also serves the `/event` stream.
    pub task_base: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub feed_reconnect_base: Duration,
    pub directory_refresh: Duration,
    pub default_session: String,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn millis_var(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

fn check_scheme(name: &str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    if schemes.iter().any(|s| value.starts_with(s)) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' must start with one of {:?}", value, schemes),
        ))
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let ws_url = var_or("KIOSK_WS_URL", "ws://127.0.0.1:8080/ws");
        let http_base = var_or("KIOSK_HTTP_BASE", "http://127.0.0.1:8080")
            .trim_end_matches('/')
            .to_string();
        let task_base = std::env::var("KIOSK_TASK_BASE")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| format!("{}/oc", http_base));

        let reconnect_base = millis_var("KIOSK_RECONNECT_BASE_MS", 1000)?;
        let reconnect_max = millis_var("KIOSK_RECONNECT_MAX_MS", 30_000)?;
        let feed_reconnect_base = millis_var("KIOSK_FEED_RECONNECT_BASE_MS", 500)?;

        let refresh_str = var_or("KIOSK_DIRECTORY_REFRESH_SECS", "10");
        let refresh_secs = refresh_str.trim().parse::<u64>().map_err(|e| {
            ConfigError::InvalidValue("KIOSK_DIRECTORY_REFRESH_SECS".to_string(), e.to_string())
        })?;
        if refresh_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "KIOSK_DIRECTORY_REFRESH_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let default_session = var_or("KIOSK_DEFAULT_SESSION", "voice:local");

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let config = Self {
            ws_url,
            http_base,
            task_base,
            reconnect_base,
            reconnect_max,
            feed_reconnect_base,
            directory_refresh: Duration::from_secs(refresh_secs),
            default_session,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that flags or env vars could break.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme("KIOSK_WS_URL", &self.ws_url, &["ws://", "wss://"])?;
        check_scheme("KIOSK_HTTP_BASE", &self.http_base, &["http://", "https://"])?;
        check_scheme("KIOSK_TASK_BASE", &self.task_base, &["http://", "https://"])?;
        if self.reconnect_base > self.reconnect_max {
            return Err(ConfigError::InvalidValue(
                "KIOSK_RECONNECT_BASE_MS".to_string(),
                "must not exceed KIOSK_RECONNECT_MAX_MS".to_string(),
            ));
        }
        if self.feed_reconnect_base > self.reconnect_max {
            return Err(ConfigError::InvalidValue(
                "KIOSK_FEED_RECONNECT_BASE_MS".to_string(),
                "must not exceed KIOSK_RECONNECT_MAX_MS".to_string(),
            ));
        }
        if self.default_session.trim().is_empty() {
            return Err(ConfigError::MissingVar("KIOSK_DEFAULT_SESSION".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("KIOSK_WS_URL");
            env::remove_var("KIOSK_HTTP_BASE");
            env::remove_var("KIOSK_TASK_BASE");
            env::remove_var("KIOSK_RECONNECT_BASE_MS");
            env::remove_var("KIOSK_RECONNECT_MAX_MS");
            env::remove_var("KIOSK_FEED_RECONNECT_BASE_MS");
            env::remove_var("KIOSK_DIRECTORY_REFRESH_SECS");
            env::remove_var("KIOSK_DEFAULT_SESSION");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env_vars();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.ws_url, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.http_base, "http://127.0.0.1:8080");
        assert_eq!(config.task_base, "http://127.0.0.1:8080/oc");
        assert_eq!(config.reconnect_base, Duration::from_millis(1000));
        assert_eq!(config.reconnect_max, Duration::from_millis(30_000));
        assert_eq!(config.feed_reconnect_base, Duration::from_millis(500));
        assert_eq!(config.directory_refresh, Duration::from_secs(10));
        assert_eq!(config.default_session, "voice:local");
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("KIOSK_WS_URL", "wss://kiosk.lan/ws");
            env::set_var("KIOSK_HTTP_BASE", "https://kiosk.lan/");
            env::set_var("KIOSK_TASK_BASE", "http://10.0.0.2:5001/oc/");
            env::set_var("KIOSK_RECONNECT_BASE_MS", "250");
            env::set_var("KIOSK_RECONNECT_MAX_MS", "5000");
            env::set_var("KIOSK_DIRECTORY_REFRESH_SECS", "30");
            env::set_var("KIOSK_DEFAULT_SESSION", "voice:hall");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.ws_url, "wss://kiosk.lan/ws");
        assert_eq!(config.http_base, "https://kiosk.lan");
        assert_eq!(config.task_base, "http://10.0.0.2:5001/oc");
        assert_eq!(config.reconnect_base, Duration::from_millis(250));
        assert_eq!(config.reconnect_max, Duration::from_millis(5000));
        assert_eq!(config.directory_refresh, Duration::from_secs(30));
        assert_eq!(config.default_session, "voice:hall");
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_invalid_ws_url() {
        clear_env_vars();
        unsafe {
            env::set_var("KIOSK_WS_URL", "http://127.0.0.1:8080/ws");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "KIOSK_WS_URL"),
            _ => panic!("Expected InvalidValue for KIOSK_WS_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_non_numeric_backoff() {
        clear_env_vars();
        unsafe {
            env::set_var("KIOSK_RECONNECT_BASE_MS", "soon");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "KIOSK_RECONNECT_BASE_MS"),
            _ => panic!("Expected InvalidValue for KIOSK_RECONNECT_BASE_MS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_base_above_max() {
        clear_env_vars();
        unsafe {
            env::set_var("KIOSK_RECONNECT_BASE_MS", "60000");
        }

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var, _) if var == "KIOSK_RECONNECT_BASE_MS"));
    }

    #[test]
    #[serial]
    fn test_config_zero_refresh() {
        clear_env_vars();
        unsafe {
            env::set_var("KIOSK_DIRECTORY_REFRESH_SECS", "0");
        }

        let err = Config::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue(var, _) if var == "KIOSK_DIRECTORY_REFRESH_SECS")
        );
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}
