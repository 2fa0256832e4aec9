use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{EndpointConfig, RemoteStorage, StorageRegistry};
use crate::transport::Signaler;

/// Display names longer than this are truncated in listings.
const MAX_DISPLAY_NAME: usize = 64;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One paired remote device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaling_key: Option<String>,
    /// Shared secret for the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl DeviceSettings {
    pub fn display_name(&self) -> String {
        let name = self
            .name
            .as_deref()
            .or(self.user_agent.as_deref())
            .unwrap_or(&self.room_id);
        name.chars().take(MAX_DISPLAY_NAME).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub devices: Vec<DeviceSettings>,
    /// Room-id prefix stripped off to form mount ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_prefix: Option<String>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings, SettingsError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Settings, SettingsError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("devices").is_some() {
            Ok(serde_json::from_value(value)?)
        } else {
            // Legacy single-device form.
            let device: DeviceSettings = serde_json::from_value(value)?;
            Ok(Settings {
                devices: vec![device],
                room_prefix: None,
            })
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|dir| dir.join("peerfs").join("settings.json"))
    }

    pub fn mount_id(&self, room_id: &str) -> String {
        match &self.room_prefix {
            Some(prefix) => room_id.strip_prefix(prefix.as_str()).unwrap_or(room_id),
            None => room_id,
        }
        .to_owned()
    }
}

/// Registers one remote mount per configured device.
pub fn register_devices(
    registry: &StorageRegistry,
    signaler: Arc<dyn Signaler>,
    settings: &Settings,
) {
    for device in &settings.devices {
        let mut config = EndpointConfig::new(device.room_id.clone());
        config.signaling_key = device.signaling_key.clone();
        config.secret = device.token.clone();
        let storage = RemoteStorage::new(device.display_name(), signaler.clone(), config);
        registry.add_storage(settings.mount_id(&device.room_id), Arc::new(storage));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_device_list() {
        let settings = Settings::parse(
            r#"{
                "roomPrefix": "user@rdp-room-",
                "devices": [
                    {"roomId": "user@rdp-room-abc", "token": "s3cret", "name": "Desktop"},
                    {"roomId": "user@rdp-room-def", "userAgent": "Laptop (Firefox)"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(settings.devices.len(), 2);
        assert_eq!(settings.devices[0].display_name(), "Desktop");
        assert_eq!(settings.devices[1].display_name(), "Laptop (Firefox)");
        assert_eq!(settings.mount_id("user@rdp-room-abc"), "abc");
        assert_eq!(settings.mount_id("other"), "other");
    }

    #[test]
    fn test_parse_legacy_single_device() {
        let settings = Settings::parse(r#"{"roomId": "room-1", "token": "t"}"#).unwrap();
        assert_eq!(settings.devices.len(), 1);
        assert_eq!(settings.devices[0].room_id, "room-1");
    }

    #[test]
    fn test_display_name_truncated() {
        let device = DeviceSettings {
            room_id: "r".to_owned(),
            signaling_key: None,
            token: None,
            name: Some("x".repeat(100)),
            user_agent: None,
        };
        assert_eq!(device.display_name().len(), 64);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"devices": [{{"roomId": "room-9"}}]}}"#).unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.devices[0].room_id, "room-9");
        assert_eq!(settings.devices[0].display_name(), "room-9");
    }
}
