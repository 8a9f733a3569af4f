use serde::{Deserialize, Serialize};

use crate::protocol;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub host: String,
    pub api_port: u16,
    pub insecure_api_port: u16,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub force_http: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            host: "thinx.cloud".to_string(),
            api_port: 7443,
            insecure_api_port: 7442,
            mqtt_host: "thinx.cloud".to_string(),
            mqtt_port: 1883,
            force_http: false,
        }
    }
}

impl CloudConfig {
    pub fn active_api_port(&self) -> u16 {
        if self.force_http {
            self.insecure_api_port
        } else {
            self.api_port
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    pub firmware_version: String,
    pub firmware_version_short: String,
    pub commit_id: String,
    pub env_hash: String,
    pub platform: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        let short = env!("CARGO_PKG_VERSION").to_string();
        Self {
            firmware_version: format!("thinx-device-rust:{short}"),
            firmware_version_short: short,
            commit_id: "0".to_string(),
            env_hash: "cafebabe".to_string(),
            platform: format!("rust:{}", std::env::consts::ARCH),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub checkin_interval_ms: u64,
    pub reboot_interval_ms: u64,
    pub checkin_timeout_ms: u64,
    pub bus_reconnect_timeout_ms: u64,
    pub migration_timeout_ms: u64,
    pub link_probe_timeout_ms: u64,
    pub link_probe_interval_ms: u64,
    pub link_retry_limit: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            checkin_interval_ms: 86_400_000,
            reboot_interval_ms: 86_400_000,
            checkin_timeout_ms: 30_000,
            bus_reconnect_timeout_ms: 10_000,
            migration_timeout_ms: 20_000,
            link_probe_timeout_ms: 5_000,
            link_probe_interval_ms: 15_000,
            link_retry_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub cloud: CloudConfig,
    pub build: BuildInfo,
    pub timing: TimingConfig,
    pub owner: String,
    pub api_key: String,
    pub alias: String,
    pub udid: String,
    pub mac: String,
    pub fcid: String,
    pub auto_update: bool,
    pub forced_update: bool,
    pub timezone_offset_hours: i64,
    pub access_point_name: String,
    pub access_point_password: String,
    pub last_will: String,
    pub initial_status: String,
    pub checkin_memory_floor: u64,
    pub update_memory_floor: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cloud: CloudConfig::default(),
            build: BuildInfo::default(),
            timing: TimingConfig::default(),
            owner: String::new(),
            api_key: String::new(),
            alias: "unnamed".to_string(),
            udid: String::new(),
            mac: "5CCF7F000000".to_string(),
            fcid: "000000".to_string(),
            auto_update: true,
            forced_update: false,
            timezone_offset_hours: 0,
            access_point_name: "THiNX-AP".to_string(),
            access_point_password: "PASSWORD".to_string(),
            last_will: protocol::STATUS_DISCONNECTED.to_string(),
            initial_status: "Registered".to_string(),
            checkin_memory_floor: 3_000,
            update_memory_floor: 3_000,
        }
    }
}
