use thiserror::Error;
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::identity::{DeviceIdentity, RestoreOutcome, NAME_MIN_LEN};
use crate::protocol::{self, CheckinRequest, CheckinStatus};
use crate::router;
use crate::topics;
use crate::update::{self, UpdateDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    ConnectLink,
    ConnectApi,
    ConnectBus,
    SubscribeBus,
    Finalize,
    Completed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::ConnectLink => "CONNECT_LINK",
            Self::ConnectApi => "CONNECT_API",
            Self::ConnectBus => "CONNECT_BUS",
            Self::SubscribeBus => "SUBSCRIBE_BUS",
            Self::Finalize => "FINALIZE",
            Self::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    RebootInterval,
    LowMemoryUpdate,
    UpdateApplied,
    LegacyUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusCredentials {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub status_topic: String,
    pub last_will: String,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("api connection failed: {0}")]
    Connect(String),
    #[error("api response timed out")]
    Timeout,
    #[error("api transport error: {0}")]
    Transport(String),
}

/// Work the controller wants the host to perform. Results of the asynchronous
/// ones come back through the matching `complete_*` method.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BringUpLink,
    StartAccessPoint,
    Checkin { body: String },
    ConnectBus(BusCredentials),
    SubscribeBus { topic: String },
    Publish { topic: String, message: String, retain: bool },
    PublishStatus { message: String, retain: bool },
    SaveIdentity(DeviceIdentity),
    StartUpdate { reference: String },
    Reboot(RebootReason),
    RunFinalizeHook,
    ForwardConfig(String),
    MigrateCredentials { ssid: String, pass: String },
}

/// The process-wide mutable device state: working identity, update policy
/// flags, update references and the reported status. Initialized once at
/// startup from build-time constants plus the restored identity record; the
/// controller is its only owner.
#[derive(Debug, Clone)]
pub struct DeviceRuntime {
    pub config: DeviceConfig,
    pub identity: DeviceIdentity,
    pub auto_update: bool,
    pub forced_update: bool,
    pub available_update: String,
    pub deferred_update: String,
    pub last_checkin_timestamp: i64,
    pub last_checkin_ms: u64,
    pub status: String,
    pub latitude: f64,
    pub longitude: f64,
    pub rssi: Option<i32>,
}

impl DeviceRuntime {
    pub fn new(config: DeviceConfig) -> Self {
        let identity = DeviceIdentity {
            owner: config.owner.clone(),
            api_key: config.api_key.clone(),
            udid: config.udid.clone(),
            alias: config.alias.clone(),
            pending_update: String::new(),
        };

        Self {
            auto_update: config.auto_update,
            forced_update: config.forced_update,
            available_update: String::new(),
            deferred_update: String::new(),
            last_checkin_timestamp: 0,
            last_checkin_ms: 0,
            status: config.initial_status.clone(),
            latitude: 0.0,
            longitude: 0.0,
            rssi: None,
            identity,
            config,
        }
    }

    /// Merges a restored identity record over the build-time defaults. An
    /// explicitly configured owner or API key wins over the stored one; the
    /// server-assigned fields always come from the store.
    pub fn absorb_restored(&mut self, restored: DeviceIdentity) {
        if !restored.owner.is_empty() && self.identity.owner.len() < NAME_MIN_LEN {
            self.identity.owner = restored.owner;
        }
        if !restored.api_key.is_empty() && !self.identity.has_api_key() {
            self.identity.api_key = restored.api_key;
        }
        if !restored.udid.is_empty() {
            self.identity.udid = restored.udid;
        }
        if !restored.alias.is_empty() {
            self.identity.alias = restored.alias;
        }
        if !restored.pending_update.is_empty() {
            self.available_update = restored.pending_update.clone();
            self.identity.pending_update = restored.pending_update;
        }
    }

    pub fn checkin_request(&self) -> CheckinRequest {
        let build = &self.config.build;
        CheckinRequest {
            registration: CheckinStatus {
                mac: self.config.mac.clone(),
                firmware: build.firmware_version.clone(),
                version: present(&build.firmware_version_short, NAME_MIN_LEN),
                commit: present(&build.commit_id, NAME_MIN_LEN),
                owner: present(&self.identity.owner, NAME_MIN_LEN),
                alias: present(&self.identity.alias, NAME_MIN_LEN),
                udid: if self.identity.has_udid() {
                    Some(self.identity.udid.clone())
                } else {
                    None
                },
                status: present(&self.status, 1),
                lat: Some(format!("{:.6}", self.latitude)),
                lon: Some(format!("{:.6}", self.longitude)),
                rssi: self.rssi.map(|rssi| rssi.to_string()),
                platform: build.platform.clone(),
                fcid: self.config.fcid.clone(),
            },
        }
    }

    /// Seconds since the Unix epoch as the device estimates them: the last
    /// server timestamp plus elapsed monotonic time.
    pub fn epoch(&self, now_ms: u64) -> i64 {
        let elapsed_s = now_ms.saturating_sub(self.last_checkin_ms) / 1_000;
        self.last_checkin_timestamp + elapsed_s as i64
    }

    pub fn device_time(&self, now_ms: u64) -> String {
        self.format_epoch(now_ms, "%T")
    }

    pub fn device_date(&self, now_ms: u64) -> String {
        self.format_epoch(now_ms, "%Y-%m-%d")
    }

    fn format_epoch(&self, now_ms: u64, format: &str) -> String {
        chrono::DateTime::from_timestamp(self.epoch(now_ms), 0)
            .map(|stamp| stamp.format(format).to_string())
            .unwrap_or_default()
    }

    pub fn device_channel(&self) -> String {
        topics::device_channel(&self.identity.owner, &self.identity.udid)
    }

    pub fn status_channel(&self) -> String {
        topics::status_channel(&self.identity.owner, &self.identity.udid)
    }
}

fn present(value: &str, min_len: usize) -> Option<String> {
    if value.len() >= min_len {
        Some(value.to_string())
    } else {
        None
    }
}

/// The device lifecycle state machine. `tick` performs at most one phase's
/// worth of work and returns the commands for the host to execute; results of
/// asynchronous work come back through the `complete_*` methods, which may
/// emit follow-up commands. The phase only moves forward, except that link
/// loss resets it to CONNECT_LINK from anywhere.
#[derive(Debug)]
pub struct LifecycleController {
    runtime: DeviceRuntime,
    phase: Phase,
    link_up: bool,
    link_attempt_in_flight: bool,
    link_retries: u32,
    ap_mode: bool,
    checkin_in_flight: bool,
    bus_connected: bool,
    bus_connect_in_flight: bool,
    bus_subscribe_in_flight: bool,
    finalize_done: bool,
    next_checkin_at: u64,
    next_reboot_at: u64,
}

impl LifecycleController {
    pub fn new(config: DeviceConfig, restored: RestoreOutcome, now_ms: u64) -> Self {
        let mut runtime = DeviceRuntime::new(config);
        match restored {
            RestoreOutcome::Found(identity) => runtime.absorb_restored(identity),
            RestoreOutcome::NotFound => info!("no persisted identity, using build defaults"),
            RestoreOutcome::Corrupt => {
                warn!("persisted identity is corrupt, using build defaults")
            }
        }

        // Retry faster before the very first checkin.
        let next_checkin_at = now_ms + runtime.config.timing.checkin_interval_ms / 4;
        let next_reboot_at = now_ms + runtime.config.timing.reboot_interval_ms;

        Self {
            runtime,
            phase: Phase::Init,
            link_up: false,
            link_attempt_in_flight: false,
            link_retries: 0,
            ap_mode: false,
            checkin_in_flight: false,
            bus_connected: false,
            bus_connect_in_flight: false,
            bus_subscribe_in_flight: false,
            finalize_done: false,
            next_checkin_at,
            next_reboot_at,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn runtime(&self) -> &DeviceRuntime {
        &self.runtime
    }

    pub fn is_bus_connected(&self) -> bool {
        self.bus_connected
    }

    pub fn is_access_point(&self) -> bool {
        self.ap_mode
    }

    pub fn tick(&mut self, now_ms: u64, free_memory: u64) -> Vec<Command> {
        let reboot_interval_ms = self.runtime.config.timing.reboot_interval_ms;
        let checkin_interval_ms = self.runtime.config.timing.checkin_interval_ms;
        let link_retry_limit = self.runtime.config.timing.link_retry_limit;

        // The reboot deadline wins over any phase work.
        if reboot_interval_ms > 0 && now_ms >= self.next_reboot_at {
            return vec![
                Command::PublishStatus {
                    message: protocol::STATUS_REBOOTING.to_string(),
                    retain: false,
                },
                Command::Reboot(RebootReason::RebootInterval),
            ];
        }

        let mut commands = Vec::new();
        match self.phase {
            Phase::Init => {
                // Build constants and the restored record were merged at
                // construction; nothing else to do before the link phase.
                self.enter(Phase::ConnectLink);
            }
            Phase::ConnectLink => {
                if self.link_up {
                    self.enter(Phase::ConnectApi);
                } else if !self.link_attempt_in_flight {
                    self.link_attempt_in_flight = true;
                    if self.link_retries >= link_retry_limit {
                        warn!(
                            retries = self.link_retries,
                            "link retries exhausted, falling back to access point"
                        );
                        commands.push(Command::StartAccessPoint);
                    } else {
                        commands.push(Command::BringUpLink);
                    }
                }
            }
            Phase::ConnectApi => {
                if self.ap_mode {
                    // No route to the cloud while advertising locally.
                } else if !self.checkin_in_flight {
                    if !self.runtime.identity.has_api_key() {
                        warn!("no API key, cannot check in");
                    } else if free_memory < self.runtime.config.checkin_memory_floor {
                        warn!(free_memory, "not enough memory to check in, skipping");
                    } else {
                        match self.runtime.checkin_request().to_json() {
                            Ok(body) => {
                                self.checkin_in_flight = true;
                                commands.push(Command::Checkin { body });
                            }
                            Err(err) => warn!("checkin body serialization failed: {err}"),
                        }
                    }
                }
            }
            Phase::ConnectBus => {
                if !self.runtime.identity.has_udid() {
                    // Not yet registered; the bus needs the udid for auth and
                    // topic naming.
                    self.enter(Phase::Finalize);
                } else if self.bus_connected {
                    self.enter(Phase::SubscribeBus);
                } else if !self.bus_connect_in_flight {
                    self.bus_connect_in_flight = true;
                    commands.push(Command::ConnectBus(self.bus_credentials()));
                }
            }
            Phase::SubscribeBus => {
                if !self.bus_subscribe_in_flight {
                    self.bus_subscribe_in_flight = true;
                    commands.push(Command::SubscribeBus {
                        topic: self.runtime.device_channel(),
                    });
                }
            }
            Phase::Finalize => {
                if !self.finalize_done {
                    self.finalize_done = true;
                    commands.push(Command::RunFinalizeHook);
                }
                self.enter(Phase::Completed);
            }
            Phase::Completed => {
                if checkin_interval_ms > 0 && now_ms >= self.next_checkin_at {
                    info!("checkin interval arrived");
                    self.enter(Phase::ConnectApi);
                } else {
                    commands.extend(self.drain_deferred_update(free_memory));
                }
            }
        }

        commands
    }

    pub fn complete_link_attempt(&mut self, up: bool, access_point: bool) {
        self.link_attempt_in_flight = false;
        if up {
            self.link_up = true;
            self.ap_mode = access_point;
            self.link_retries = 0;
        } else {
            self.link_retries = self.link_retries.saturating_add(1);
        }
    }

    /// Link loss invalidates everything downstream: bus and API state are
    /// discarded and recreated, not resumed.
    pub fn link_lost(&mut self) {
        self.link_up = false;
        self.ap_mode = false;
        self.link_attempt_in_flight = false;
        self.link_retries = 0;
        self.checkin_in_flight = false;
        self.bus_connected = false;
        self.bus_connect_in_flight = false;
        self.bus_subscribe_in_flight = false;
        if self.phase > Phase::ConnectLink {
            warn!("link lost, restarting connection sequence");
            self.enter(Phase::ConnectLink);
        }
    }

    pub fn complete_checkin(
        &mut self,
        result: Result<Vec<u8>, ChannelError>,
        now_ms: u64,
        free_memory: u64,
    ) -> Vec<Command> {
        self.checkin_in_flight = false;
        match result {
            Ok(payload) => {
                let commands = router::route(&mut self.runtime, &payload, now_ms, free_memory);
                self.next_checkin_at =
                    now_ms + self.runtime.config.timing.checkin_interval_ms;
                if self.phase == Phase::ConnectApi {
                    if self.bus_connected {
                        self.enter(Phase::Finalize);
                    } else {
                        self.enter(Phase::ConnectBus);
                    }
                }
                commands
            }
            Err(err) => {
                // Transient; retried on a later tick.
                warn!("checkin failed: {err}");
                Vec::new()
            }
        }
    }

    pub fn complete_bus_connect(&mut self, connected: bool) {
        self.bus_connect_in_flight = false;
        if connected {
            self.bus_connected = true;
            if self.phase == Phase::ConnectBus {
                self.enter(Phase::SubscribeBus);
            }
        }
    }

    pub fn complete_bus_subscribe(&mut self, subscribed: bool) -> Vec<Command> {
        self.bus_subscribe_in_flight = false;
        if !(subscribed && self.phase == Phase::SubscribeBus) {
            return Vec::new();
        }

        // Announce the full device state on the status channel once the
        // session is live.
        let mut commands = Vec::new();
        match self.runtime.checkin_request().to_json() {
            Ok(body) => commands.push(Command::PublishStatus {
                message: body,
                retain: false,
            }),
            Err(err) => warn!("status body serialization failed: {err}"),
        }
        self.enter(Phase::Finalize);
        commands
    }

    pub fn bus_dropped(&mut self) {
        self.bus_connected = false;
    }

    /// Routes one inbound bus publish. Shares the full response-routing path
    /// with checkin responses.
    pub fn handle_bus_message(
        &mut self,
        payload: &[u8],
        now_ms: u64,
        free_memory: u64,
    ) -> Vec<Command> {
        router::route(&mut self.runtime, payload, now_ms, free_memory)
    }

    pub fn complete_update(&mut self, result: Result<(), String>) -> Vec<Command> {
        match result {
            Ok(()) => vec![
                Command::PublishStatus {
                    message: protocol::UPDATE_SUCCESS_NOTIFICATION.to_string(),
                    retain: false,
                },
                Command::Reboot(RebootReason::UpdateApplied),
            ],
            Err(message) => {
                warn!("firmware update failed: {message}");
                self.runtime.status = message.clone();
                vec![Command::PublishStatus {
                    message: format!("{{ \"status\" : \"{message}\" }}"),
                    retain: false,
                }]
            }
        }
    }

    /// Updates the dashboard status string. After the first finalize this also
    /// requests an immediate re-checkin and announces the status on the bus.
    pub fn set_dashboard_status(&mut self, status: impl Into<String>) -> Vec<Command> {
        self.runtime.status = status.into();
        if !(self.link_up && self.phase > Phase::Finalize) {
            return Vec::new();
        }

        self.enter(Phase::ConnectApi);
        vec![Command::PublishStatus {
            message: format!("{{ \"status\" : \"{}\" }}", self.runtime.status),
            retain: false,
        }]
    }

    pub fn set_location(&mut self, latitude: f64, longitude: f64) {
        self.runtime.latitude = latitude;
        self.runtime.longitude = longitude;
        if self.link_up && self.phase > Phase::Finalize {
            self.enter(Phase::ConnectApi);
        }
    }

    pub fn set_rssi(&mut self, rssi: i32) {
        self.runtime.rssi = Some(rssi);
    }

    pub fn set_checkin_interval(&mut self, interval_ms: u64) {
        self.runtime.config.timing.checkin_interval_ms = interval_ms;
    }

    pub fn set_reboot_interval(&mut self, interval_ms: u64, now_ms: u64) {
        self.runtime.config.timing.reboot_interval_ms = interval_ms;
        self.next_reboot_at = now_ms + interval_ms;
    }

    /// Swaps the broker last-will payload; takes effect through a reconnect.
    pub fn set_last_will(&mut self, last_will: impl Into<String>) -> Vec<Command> {
        self.runtime.config.last_will = last_will.into();
        if !self.bus_connected {
            return Vec::new();
        }
        self.bus_connected = false;
        vec![Command::ConnectBus(self.bus_credentials())]
    }

    fn bus_credentials(&self) -> BusCredentials {
        BusCredentials {
            client_id: self.runtime.config.mac.clone(),
            username: self.runtime.identity.udid.clone(),
            password: self.runtime.identity.api_key.clone(),
            status_topic: self.runtime.status_channel(),
            last_will: self.runtime.config.last_will.clone(),
        }
    }

    fn drain_deferred_update(&mut self, free_memory: u64) -> Vec<Command> {
        match update::maybe_apply(
            &self.runtime.deferred_update,
            free_memory,
            self.runtime.config.update_memory_floor,
        ) {
            UpdateDecision::Idle => Vec::new(),
            UpdateDecision::Start(reference) => {
                info!(reference, "starting deferred firmware update");
                self.runtime.deferred_update.clear();
                vec![Command::StartUpdate { reference }]
            }
            UpdateDecision::Reboot => {
                warn!("deferred update pending with critically low memory, rebooting");
                vec![Command::Reboot(RebootReason::LowMemoryUpdate)]
            }
        }
    }

    fn enter(&mut self, next: Phase) {
        if self.phase != next {
            info!(from = self.phase.as_str(), to = next.as_str(), "phase");
            self.phase = next;
        }
    }
}
