use serde::{Deserialize, Serialize};

pub const REGISTRATION_PATH: &str = "/device/register";
pub const FIRMWARE_PATH: &str = "/device/firmware";
pub const USER_AGENT: &str = "THiNX-Client";

pub const STATUS_DISCONNECTED: &str = "{ \"status\" : \"disconnected\" }";
pub const STATUS_UPDATE_STARTED: &str = "{ \"status\" : \"update_started\" }";
pub const STATUS_REBOOTING: &str = "{ \"status\" : \"rebooting\" }";

// Interaction payloads sent back to the console. Kept byte-for-byte from the
// protocol's current revision, unquoted keys included.
pub const UPDATE_AVAILABLE_NOTIFICATION: &str = "{ title: \"Update Available\", body: \"There is an update available for this device. Do you want to install it now?\", type: \"actionable\", response_type: \"bool\" }";
pub const UPDATE_SUCCESS_NOTIFICATION: &str = "{ title: \"Update Successful\", body: \"The device has been successfully updated.\", type: \"success\" }";

/// One checkin report. Optional fields are sent only when the device knows
/// them; the server fills the gaps on registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckinStatus {
    pub mac: String,
    pub firmware: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<String>,
    pub platform: String,
    pub fcid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckinRequest {
    pub registration: CheckinStatus,
}

impl CheckinRequest {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Registration-section view shared by the registration and firmware-update
/// response kinds. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationSection {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub udid: String,
    #[serde(default)]
    pub auto_update: Option<bool>,
    #[serde(default)]
    pub forced_update: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub ott: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub env_hash: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationSection {
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub response: serde_json::Value,
}

pub const ENV_SSID_KEY: &str = "THINX_ENV_SSID";
pub const ENV_PASS_KEY: &str = "THINX_ENV_PASS";
