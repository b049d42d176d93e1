//! Typed settings tree.
//!
//! The whole configuration serializes as one JSON document under the `config`
//! key of the settings table. Unknown keys are rejected on load so a typo in a
//! hand-edited value fails loudly instead of silently falling back to a
//! default. Saving publishes `settings:changed` / `settings:updated` on the
//! event bus; running sessions are never preempted by a change.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::db::{Repository, RepositoryError};
use crate::events::{Event, EventBus};

const SETTINGS_KEY: &str = "config";

/// Error types for configuration load/save.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// The enumerated configuration record. Every key is listed here; there is no
/// untyped property bag anywhere in the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub max_concurrent_streams: u32,
    pub max_concurrent_per_channel: u32,
    pub stream_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub ssdp_enabled: bool,
    pub ssdp_announce_interval_ms: u64,
    pub ssdp_multicast_address: String,
    pub advertised_host: Option<String>,
    pub streaming_port: u16,
    pub discovery_port: u16,
    pub tuner_count: u32,
    pub device_id: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub firmware_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 5,
            max_concurrent_per_channel: 3,
            stream_timeout_ms: 30_000,
            grace_period_ms: 10_000,
            ssdp_enabled: true,
            ssdp_announce_interval_ms: 1_800_000,
            ssdp_multicast_address: "239.255.255.250".to_string(),
            advertised_host: None,
            streaming_port: 8080,
            discovery_port: 1900,
            tuner_count: 4,
            device_id: generate_device_id(),
            friendly_name: "PlexBridge".to_string(),
            manufacturer: "Silicondust".to_string(),
            model_name: "HDTC-2US".to_string(),
            firmware_version: "20240101".to_string(),
        }
    }
}

impl Settings {
    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_streams == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_streams must be at least 1".into(),
            ));
        }
        if self.max_concurrent_per_channel == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_per_channel must be at least 1".into(),
            ));
        }
        if self.device_id.len() != 8 || !self.device_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::Invalid(format!(
                "device_id must be 8 hex characters, got '{}'",
                self.device_id
            )));
        }
        if self.ssdp_multicast_address.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "ssdp_multicast_address is not a valid IPv4 address: '{}'",
                self.ssdp_multicast_address
            )));
        }
        Ok(())
    }

    /// Advertised base URL, e.g. `http://10.0.0.5:8080`. An explicit
    /// `advertised_host` wins; otherwise the outgoing-route local address.
    pub fn base_url(&self) -> String {
        match &self.advertised_host {
            Some(host) if !host.is_empty() => host.trim_end_matches('/').to_string(),
            _ => format!("http://{}:{}", get_local_ip(), self.streaming_port),
        }
    }
}

/// Generate a stable DeviceID based on machine hostname.
///
/// Produces 8 uppercase hex characters that persist across restarts.
pub fn generate_device_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "plexbridge".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:08X}", hasher.finish() as u32)
}

/// Get the local IP address for advertised URLs.
///
/// Falls back to 127.0.0.1 when detection fails.
pub fn get_local_ip() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Shared configuration store: load-once, snapshot reads, save-with-notify.
pub struct ConfigStore {
    repo: Repository,
    current: RwLock<Settings>,
    events: EventBus,
}

impl ConfigStore {
    /// Load the persisted settings, writing defaults on first boot.
    pub fn load(repo: Repository, events: EventBus) -> Result<Self, ConfigError> {
        let settings = match repo.get_setting(SETTINGS_KEY)? {
            Some(json) => {
                let parsed: Settings = serde_json::from_str(&json)?;
                parsed.validate()?;
                parsed
            }
            None => {
                let defaults = Settings::default();
                repo.set_setting(SETTINGS_KEY, &serde_json::to_string(&defaults)?)?;
                tracing::info!(device_id = %defaults.device_id, "wrote default configuration");
                defaults
            }
        };

        Ok(Self {
            repo,
            current: RwLock::new(settings),
            events,
        })
    }

    /// In-memory store for tests; nothing is persisted.
    pub fn with_settings(repo: Repository, events: EventBus, settings: Settings) -> Self {
        Self {
            repo,
            current: RwLock::new(settings),
            events,
        }
    }

    /// Snapshot of the current settings.
    pub fn get(&self) -> Settings {
        self.current.read().expect("settings lock poisoned").clone()
    }

    /// Validate, persist, swap, and notify. Capacity changes affect future
    /// admissions only.
    pub fn save(&self, new: Settings) -> Result<(), ConfigError> {
        new.validate()?;
        self.repo
            .set_setting(SETTINGS_KEY, &serde_json::to_string(&new)?)?;

        {
            let mut guard = self.current.write().expect("settings lock poisoned");
            *guard = new.clone();
        }

        self.events.publish(Event::SettingsChanged {
            settings: new.clone(),
        });
        self.events.publish(Event::SettingsUpdated { settings: new });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().expect("defaults must validate");
        assert_eq!(settings.max_concurrent_streams, 5);
        assert_eq!(settings.max_concurrent_per_channel, 3);
        assert_eq!(settings.grace_period_ms, 10_000);
        assert_eq!(settings.tuner_count, 4);
    }

    #[test]
    fn test_device_id_is_stable_8_hex() {
        let a = generate_device_id();
        let b = generate_device_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let json = r#"{"max_concurrent_streams": 5, "not_a_real_key": true}"#;
        let parsed: Result<Settings, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"max_concurrent_streams": 2, "friendly_name": "Bridge"}"#;
        let parsed: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.max_concurrent_streams, 2);
        assert_eq!(parsed.friendly_name, "Bridge");
        assert_eq!(parsed.max_concurrent_per_channel, 3);
    }

    #[test]
    fn test_validation_rejects_zero_caps_and_bad_device_id() {
        let mut settings = Settings::default();
        settings.max_concurrent_streams = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.device_id = "nothex!!".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.device_id = "1A2B3C".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_base_url_prefers_advertised_host() {
        let mut settings = Settings::default();
        settings.advertised_host = Some("http://10.0.0.5:8080/".into());
        assert_eq!(settings.base_url(), "http://10.0.0.5:8080");
    }

    #[test]
    fn test_base_url_falls_back_to_local_ip() {
        let mut settings = Settings::default();
        settings.advertised_host = None;
        settings.streaming_port = 9090;
        let url = settings.base_url();
        assert!(url.starts_with("http://"));
        assert!(url.ends_with(":9090"));
    }
}
