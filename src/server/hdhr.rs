//! HDHomeRun emulation.
//!
//! Builds the device identity Plex discovers and the discovery/lineup
//! responses of the HDHomeRun HTTP API. All response shapes use PascalCase
//! field names for protocol compatibility.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::config::Settings;
use crate::db::models::Channel;

/// Firmware name reported to Plex. Matches what real HDHomeRun ATSC units
/// announce; Plex keys some behavior off the prefix.
const FIRMWARE_NAME: &str = "hdhomerun5_atsc";

/// Process-singleton tuner identity derived from settings.
#[derive(Debug, Clone)]
pub struct TunerIdentity {
    pub device_id: String,
    pub device_auth: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub firmware_name: String,
    pub firmware_version: String,
    pub tuner_count: u32,
    pub base_url: String,
}

impl TunerIdentity {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            device_id: settings.device_id.to_uppercase(),
            device_auth: derive_device_auth(&settings.device_id),
            friendly_name: settings.friendly_name.clone(),
            manufacturer: settings.manufacturer.clone(),
            model_name: settings.model_name.clone(),
            firmware_name: FIRMWARE_NAME.to_string(),
            firmware_version: settings.firmware_version.clone(),
            tuner_count: settings.tuner_count,
            base_url: settings.base_url(),
        }
    }
}

/// Stable DeviceAuth token derived from the device id. Plex echoes it back
/// but nothing validates it; it only has to be consistent.
fn derive_device_auth(device_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// HDHomeRun discovery response, returned by `GET /discover.json`.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_auth: String,
    #[serde(rename = "BaseURL")]
    pub base_url: String,
    #[serde(rename = "LineupURL")]
    pub lineup_url: String,
    pub tuner_count: u32,
}

/// HDHomeRun channel lineup entry, returned by `GET /lineup.json` as array.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntry {
    pub guide_number: String,
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// HDHomeRun lineup status response, returned by `GET /lineup_status.json`.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupStatusResponse {
    pub scan_in_progress: u8,
    pub scan_possible: u8,
    pub source: String,
    pub source_list: Vec<String>,
}

/// Generate the discovery response for the current identity.
pub fn generate_discover_response(identity: &TunerIdentity) -> DiscoverResponse {
    DiscoverResponse {
        friendly_name: identity.friendly_name.clone(),
        manufacturer: identity.manufacturer.clone(),
        model_number: identity.model_name.clone(),
        firmware_name: identity.firmware_name.clone(),
        firmware_version: identity.firmware_version.clone(),
        device_id: identity.device_id.clone(),
        device_auth: identity.device_auth.clone(),
        base_url: identity.base_url.clone(),
        lineup_url: format!("{}/lineup.json", identity.base_url),
        tuner_count: identity.tuner_count,
    }
}

/// Generate the lineup from enabled channels that have a usable stream.
///
/// Stream URLs point at `/stream/{number}`; the number doubles as the Plex
/// guide number.
pub fn generate_lineup(channels: &[Channel], base_url: &str) -> Vec<LineupEntry> {
    channels
        .iter()
        .map(|channel| LineupEntry {
            guide_number: channel.number.to_string(),
            guide_name: channel.name.clone(),
            url: format!("{}/stream/{}", base_url, channel.number),
        })
        .collect()
}

/// Static scan status; IPTV lineups are pre-configured, never scanned.
pub fn generate_lineup_status() -> LineupStatusResponse {
    LineupStatusResponse {
        scan_in_progress: 0,
        scan_possible: 1,
        source: "Cable".to_string(),
        source_list: vec!["Cable".to_string()],
    }
}

/// UPnP device description served at `/device.xml`, shaped like an
/// HDHomeRun's so Plex's discovery accepts it.
pub fn generate_device_xml(identity: &TunerIdentity) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
<specVersion>
<major>1</major>
<minor>0</minor>
</specVersion>
<URLBase>{base}</URLBase>
<device>
  <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
  <friendlyName>{friendly}</friendlyName>
  <manufacturer>{manufacturer}</manufacturer>
  <modelName>{model}</modelName>
  <modelNumber>{model}</modelNumber>
  <serialNumber>{id}</serialNumber>
  <UDN>uuid:{id}</UDN>
</device>
</root>"#,
        base = identity.base_url,
        friendly = xml_escape(&identity.friendly_name),
        manufacturer = xml_escape(&identity.manufacturer),
        model = xml_escape(&identity.model_name),
        id = identity.device_id,
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> TunerIdentity {
        let mut settings = Settings::default();
        settings.device_id = "1A2B3C4D".into();
        settings.friendly_name = "PlexBridge".into();
        settings.advertised_host = Some("http://10.0.0.5:8080".into());
        settings.tuner_count = 4;
        TunerIdentity::from_settings(&settings)
    }

    fn channel(number: i32, name: &str) -> Channel {
        Channel {
            id: number,
            number,
            name: name.to_string(),
            enabled: 1,
            logo_url: None,
            epg_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_discover_response_serializes_with_pascal_case() {
        let response = generate_discover_response(&identity());
        let json = serde_json::to_string(&response).unwrap();

        assert!(json.contains("\"FriendlyName\":\"PlexBridge\""));
        assert!(json.contains("\"Manufacturer\":\"Silicondust\""));
        assert!(json.contains("\"DeviceID\":\"1A2B3C4D\""));
        assert!(json.contains("\"BaseURL\":\"http://10.0.0.5:8080\""));
        assert!(json.contains("\"LineupURL\":\"http://10.0.0.5:8080/lineup.json\""));
        assert!(json.contains("\"TunerCount\":4"));
        assert!(json.contains("\"FirmwareName\":\"hdhomerun5_atsc\""));
    }

    #[test]
    fn test_device_auth_is_stable() {
        let a = generate_discover_response(&identity()).device_auth;
        let b = generate_discover_response(&identity()).device_auth;
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_lineup_entries_use_channel_numbers() {
        let channels = vec![channel(5, "CNN"), channel(7, "BBC One")];
        let lineup = generate_lineup(&channels, "http://10.0.0.5:8080");

        assert_eq!(lineup.len(), 2);
        assert_eq!(lineup[0].guide_number, "5");
        assert_eq!(lineup[0].guide_name, "CNN");
        assert_eq!(lineup[0].url, "http://10.0.0.5:8080/stream/5");

        let json = serde_json::to_string(&lineup[0]).unwrap();
        assert!(json.contains("\"GuideNumber\":\"5\""));
        assert!(json.contains("\"GuideName\":\"CNN\""));
        assert!(json.contains("\"URL\":\"http://10.0.0.5:8080/stream/5\""));
    }

    #[test]
    fn test_empty_lineup_is_valid_empty_array() {
        let lineup = generate_lineup(&[], "http://x");
        assert_eq!(serde_json::to_string(&lineup).unwrap(), "[]");
    }

    #[test]
    fn test_lineup_status_shape() {
        let status = generate_lineup_status();
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"ScanInProgress\":0"));
        assert!(json.contains("\"ScanPossible\":1"));
        assert!(json.contains("\"Source\":\"Cable\""));
        assert!(json.contains("\"SourceList\":[\"Cable\"]"));
    }

    #[test]
    fn test_device_xml_contains_identity() {
        let xml = generate_device_xml(&identity());
        assert!(xml.contains("<URLBase>http://10.0.0.5:8080</URLBase>"));
        assert!(xml.contains("<UDN>uuid:1A2B3C4D</UDN>"));
        assert!(xml.contains("urn:schemas-upnp-org:device:MediaServer:1"));
    }

    #[test]
    fn test_device_xml_escapes_names() {
        let mut settings = Settings::default();
        settings.friendly_name = "Tom & Jerry <TV>".into();
        let identity = TunerIdentity::from_settings(&settings);
        let xml = generate_device_xml(&identity);
        assert!(xml.contains("Tom &amp; Jerry &lt;TV&gt;"));
    }
}
