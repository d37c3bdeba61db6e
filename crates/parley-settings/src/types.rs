//! Settings type definitions.
//!
//! Every section uses `#[serde(default)]` so a partial JSON file only has to
//! name the values it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the chat client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleySettings {
    pub connection: ConnectionSettings,
    pub typing: TypingSettings,
    pub protocol: ProtocolSettings,
    pub logging: LoggingSettings,
}

impl ParleySettings {
    /// Reject combinations the session cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.connection.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("connection.connect_timeout_ms must be > 0".into()));
        }
        if self.connection.close_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("connection.close_timeout_ms must be > 0".into()));
        }
        if self.connection.token_param.trim().is_empty() {
            return Err(SettingsError::InvalidValue("connection.token_param must not be empty".into()));
        }
        if self.typing.idle_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("typing.idle_timeout_ms must be > 0".into()));
        }
        if self.typing.peer_expiry_ms <= self.typing.idle_timeout_ms {
            return Err(SettingsError::InvalidValue(format!(
                "typing.peer_expiry_ms ({}) must exceed typing.idle_timeout_ms ({})",
                self.typing.peer_expiry_ms, self.typing.idle_timeout_ms
            )));
        }
        let reconnect = &self.connection.reconnect;
        if !(0.0..=1.0).contains(&reconnect.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "connection.reconnect.jitter_factor ({}) must be within 0..=1",
                reconnect.jitter_factor
            )));
        }
        if reconnect.base_delay_ms > reconnect.max_delay_ms {
            return Err(SettingsError::InvalidValue(
                "connection.reconnect.base_delay_ms must not exceed max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Transport lifecycle settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_ms: u64,
    /// How long a graceful close may take before the connection task is aborted.
    pub close_timeout_ms: u64,
    /// Query parameter carrying the bearer credential.
    pub token_param: String,
    pub reconnect: ReconnectSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
            token_param: "token".to_string(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Backoff-retry after a lost or failed connection. Off by default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

/// Typing-presence timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingSettings {
    /// Silence after the last edit before typing-stop is sent.
    pub idle_timeout_ms: u64,
    /// How long a peer "typing" indicator survives without a refresh.
    pub peer_expiry_ms: u64,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 2_000,
            peer_expiry_ms: 6_000,
        }
    }
}

impl TypingSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn peer_expiry(&self) -> Duration {
        Duration::from_millis(self.peer_expiry_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Consecutive protocol violations tolerated before the session drops the
    /// connection. `0` never drops.
    pub max_consecutive_violations: u32,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_consecutive_violations: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = ParleySettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.typing.idle_timeout(), Duration::from_secs(2));
        assert_eq!(settings.typing.peer_expiry(), Duration::from_secs(6));
        assert!(!settings.connection.reconnect.enabled);
        assert_eq!(settings.connection.token_param, "token");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: ParleySettings =
            serde_json::from_str(r#"{"typing": {"idle_timeout_ms": 1500}}"#).unwrap();
        assert_eq!(settings.typing.idle_timeout_ms, 1500);
        assert_eq!(settings.typing.peer_expiry_ms, 6000);
        assert_eq!(settings.connection, ConnectionSettings::default());
    }

    #[test]
    fn peer_expiry_must_exceed_idle_window() {
        let mut settings = ParleySettings::default();
        settings.typing.peer_expiry_ms = settings.typing.idle_timeout_ms;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("peer_expiry_ms"));
    }

    #[test]
    fn zero_timeouts_rejected() {
        let mut settings = ParleySettings::default();
        settings.connection.connect_timeout_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = ParleySettings::default();
        settings.typing.idle_timeout_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn reconnect_bounds_checked() {
        let mut settings = ParleySettings::default();
        settings.connection.reconnect.jitter_factor = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = ParleySettings::default();
        settings.connection.reconnect.base_delay_ms = 60_000;
        assert!(settings.validate().is_err());
    }
}
