//! Binary-only settings on top of [`CourierConfig`](courier_infra::CourierConfig).

use std::time::Duration;

use courier_observability::LogFormat;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct SettingsError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Where and how rendered messages are handed off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub url: String,
    pub timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8025".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub log_format: LogFormat,
    pub relay: RelaySettings,
}

impl Settings {
    /// Read `COURIER_LOG_FORMAT`, `COURIER_RELAY_URL` and
    /// `COURIER_RELAY_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let mut settings = Settings::default();

        if let Some(value) = lookup("COURIER_LOG_FORMAT") {
            settings.log_format = value.parse().map_err(|reason| SettingsError {
                key: "COURIER_LOG_FORMAT",
                value: value.clone(),
                reason,
            })?;
        }

        if let Some(url) = lookup("COURIER_RELAY_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SettingsError {
                    key: "COURIER_RELAY_URL",
                    value: url,
                    reason: "expected an http(s) URL".to_string(),
                });
            }
            settings.relay.url = url;
        }

        if let Some(value) = lookup("COURIER_RELAY_TIMEOUT_SECS") {
            let secs: u64 = value.trim().parse().map_err(|e: std::num::ParseIntError| SettingsError {
                key: "COURIER_RELAY_TIMEOUT_SECS",
                value: value.clone(),
                reason: e.to_string(),
            })?;
            settings.relay.timeout = Duration::from_secs(secs);
        }

        Ok(settings)
    }
}
