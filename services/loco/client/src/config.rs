//! Configuration handling for the LOCO client.
//!
//! Settings are read from a YAML file and then overridden by `LOCO_*`
//! environment variables. A missing file yields defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use loco_booking::{BookingConfig, DeviceInfo};
use loco_session::{BackoffPolicy, SessionConfig};
use loco_trailer::UploadConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Session timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Default request timeout (seconds)
    pub request_timeout_secs: u64,
    /// Keepalive PING period (seconds)
    pub ping_interval_secs: u64,
    /// Consecutive keepalive failures before closing, 0 to never close
    pub keepalive_failure_threshold: u32,
    /// TCP connect timeout (seconds)
    pub connect_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            ping_interval_secs: 60,
            keepalive_failure_threshold: 3,
            connect_timeout_secs: 10,
        }
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// First retry delay (milliseconds)
    pub base_delay_ms: u64,
    /// Delay cap (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// TLS settings for the booking host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Extra CA certificates (PEM file) trusted besides the web PKI roots
    pub ca_file: Option<String>,
}

/// LOCO client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocoConfig {
    /// Booking host
    pub booking: BookingConfig,
    /// Identity sent to the directory and trailer
    pub device: DeviceInfo,
    /// Session timing
    pub session: SessionSettings,
    /// Reconnect backoff
    pub reconnect: ReconnectSettings,
    /// Upload tuning
    pub upload: UploadConfig,
    /// TLS settings
    pub tls: TlsSettings,
    /// Device identifier seeding client message ids
    pub device_uuid: Option<String>,
}

impl LocoConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_yaml(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Final LOCO configuration: booking={}:{}, network_type={}, app_version={}",
            config.booking.host,
            config.booking.port,
            config.device.network_type,
            config.device.app_version
        );
        Ok(config)
    }

    /// Parse a YAML document; absent fields take their defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply overrides from the process environment
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, which maps variable names to values
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("LOCO_BOOKING_HOST") {
            info!("Booking host overridden by environment: {}", host);
            self.booking.host = host;
        }

        if let Some(port) = lookup("LOCO_BOOKING_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.booking.port = port;
                    info!("Booking port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid LOCO_BOOKING_PORT {:?}", port),
            }
        }

        if let Some(network_type) = lookup("LOCO_NETWORK_TYPE") {
            match network_type.parse::<i32>() {
                Ok(network_type) => {
                    self.device.network_type = network_type;
                    info!("Network type overridden by environment: {}", network_type);
                }
                Err(_) => warn!("Ignoring invalid LOCO_NETWORK_TYPE {:?}", network_type),
            }
        }

        if let Some(version) = lookup("LOCO_APP_VERSION") {
            info!("App version overridden by environment: {}", version);
            self.device.app_version = version;
        }

        if let Some(language) = lookup("LOCO_LANGUAGE") {
            info!("Language overridden by environment: {}", language);
            self.device.language = language;
        }

        if let Some(mccmnc) = lookup("LOCO_MCCMNC") {
            info!("MCCMNC overridden by environment: {}", mccmnc);
            self.device.mccmnc = if mccmnc.is_empty() { None } else { Some(mccmnc) };
        }

        if let Some(use_sub) = lookup("LOCO_USE_SUB") {
            match use_sub.to_lowercase().as_str() {
                "true" | "1" => self.device.use_sub = Some(true),
                "false" | "0" => self.device.use_sub = Some(false),
                "" => self.device.use_sub = None,
                _ => warn!("Ignoring invalid LOCO_USE_SUB {:?}", use_sub),
            }
        }
    }

    /// Session settings in session form
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            request_timeout: Duration::from_secs(self.session.request_timeout_secs),
            ping_interval: Duration::from_secs(self.session.ping_interval_secs),
            keepalive_failure_threshold: self.session.keepalive_failure_threshold,
            connect_timeout: Duration::from_secs(self.session.connect_timeout_secs),
            ..SessionConfig::default()
        }
    }

    /// Reconnect backoff in policy form
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.reconnect.base_delay_ms),
            max: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }

    /// Extra CA PEM contents, if a CA file is configured
    pub fn read_ca_pem(&self) -> Result<Option<String>> {
        match &self.tls.ca_file {
            Some(path) => {
                let pem = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read CA file {}", path))?;
                Ok(Some(pem))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = LocoConfig::default();
        assert_eq!(config.booking.host, "booking-loco.kakao.com");
        assert_eq!(config.booking.port, 443);
        assert_eq!(config.session.keepalive_failure_threshold, 3);
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
        assert_eq!(config.upload.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
booking:
  host: booking.test
  use_ticket: false
device:
  user_id: 42
  network_type: 3
session:
  ping_interval_secs: 30
  keepalive_failure_threshold: 0
reconnect:
  base_delay_ms: 500
upload:
  chunk_size: 4096
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = LocoConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.booking.host, "booking.test");
        assert_eq!(config.booking.port, 443);
        assert!(!config.booking.use_ticket);
        assert_eq!(config.device.user_id, 42);
        assert!(!config.device.prefers_wifi());
        assert_eq!(config.device.app_version, "3.2.8");

        let session = config.session_config();
        assert_eq!(session.ping_interval, Duration::from_secs(30));
        assert_eq!(session.keepalive_failure_threshold, 0);
        assert_eq!(session.request_timeout, Duration::from_secs(10));

        let policy = config.backoff_policy();
        assert_eq!(policy.base, Duration::from_millis(500));
        assert_eq!(policy.max, Duration::from_secs(30));
        assert_eq!(config.upload.chunk_size, 4096);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LocoConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.booking, BookingConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"booking:\n  port: not-a-number\n").unwrap();
        assert!(LocoConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LOCO_BOOKING_HOST", "override.test"),
            ("LOCO_BOOKING_PORT", "8443"),
            ("LOCO_NETWORK_TYPE", "3"),
            ("LOCO_APP_VERSION", "9.9.9"),
            ("LOCO_LANGUAGE", "en"),
            ("LOCO_MCCMNC", ""),
            ("LOCO_USE_SUB", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = LocoConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.booking.host, "override.test");
        assert_eq!(config.booking.port, 8443);
        assert_eq!(config.device.network_type, 3);
        assert_eq!(config.device.app_version, "9.9.9");
        assert_eq!(config.device.language, "en");
        assert_eq!(config.device.mccmnc, None);
        assert_eq!(config.device.use_sub, Some(false));
    }

    #[test]
    fn test_invalid_override_ignored() {
        let mut config = LocoConfig::default();
        config.apply_overrides(|key| match key {
            "LOCO_BOOKING_PORT" => Some("not-a-port".to_string()),
            "LOCO_USE_SUB" => Some("maybe".to_string()),
            _ => None,
        });
        assert_eq!(config.booking.port, 443);
        assert_eq!(config.device.use_sub, Some(true));
    }

    #[test]
    fn test_ca_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"-----BEGIN CERTIFICATE-----").unwrap();
        let config = LocoConfig {
            tls: TlsSettings {
                ca_file: Some(temp_file.path().display().to_string()),
            },
            ..LocoConfig::default()
        };
        assert!(config.read_ca_pem().unwrap().is_some());
        assert!(LocoConfig::default().read_ca_pem().unwrap().is_none());
    }
}
