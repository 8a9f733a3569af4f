use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info, warn};

use thinx_common::{Command, DeviceConfig, LifecycleController, Phase};

use crate::bus::{BusEvent, MessageBus};
use crate::channel::CloudChannel;
use crate::link::{LinkHealth, NetworkLink};
use crate::platform;
use crate::store::IdentityStore;
use crate::updater::FirmwareUpdater;

// How many queued bus events one pass will service before yielding back to
// the tick loop.
const BUS_SERVICE_BUDGET: u32 = 16;

/// Optional handler slots for the embedding application, each invoked
/// synchronously at its documented lifecycle point.
#[derive(Default)]
pub struct Hooks {
    pub on_finalize: Option<Box<dyn FnMut()>>,
    pub on_config_push: Option<Box<dyn FnMut(&str)>>,
    pub on_firmware_update: Option<Box<dyn FnMut()>>,
    pub on_bus_message: Option<Box<dyn FnMut(&[u8])>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config_from_env();
    info!(
        firmware = %config.build.firmware_version,
        cloud = %config.cloud.host,
        "starting device agent"
    );

    let store = IdentityStore::new();
    let restored = store.restore().await;
    let engine = LifecycleController::new(config.clone(), restored, platform::monotonic_ms());

    let channel = CloudChannel::new(&config)?;
    let updater = FirmwareUpdater::new(&config, channel.client());
    let link = NetworkLink::new(&config);
    let bus = MessageBus::new(&config);

    let hooks = Hooks {
        on_finalize: Some(Box::new(|| info!("device session finalized"))),
        ..Hooks::default()
    };

    let mut driver = Driver {
        engine,
        link,
        channel,
        bus,
        store,
        updater,
        hooks,
    };

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        driver.service().await;
    }
}

struct Driver {
    engine: LifecycleController,
    link: NetworkLink,
    channel: CloudChannel,
    bus: MessageBus,
    store: IdentityStore,
    updater: FirmwareUpdater,
    hooks: Hooks,
}

impl Driver {
    /// One pass of the cooperative loop: link liveness, one engine tick, the
    /// resulting commands, then pending bus traffic.
    async fn service(&mut self) {
        let now_ms = platform::monotonic_ms();

        if self.engine.phase() > Phase::ConnectLink && !self.link.is_access_point() {
            if self.link.check(now_ms).await == LinkHealth::Lost {
                self.engine.link_lost();
            }
        }

        let commands = self.engine.tick(now_ms, platform::free_memory());
        self.run_commands(commands).await;

        self.service_bus().await;
    }

    async fn run_commands(&mut self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();
        while let Some(command) = queue.pop_front() {
            let follow_ups = self.execute(command).await;
            queue.extend(follow_ups);
        }
    }

    async fn execute(&mut self, command: Command) -> Vec<Command> {
        match command {
            Command::BringUpLink => {
                let up = self.link.bring_up().await;
                self.engine.complete_link_attempt(up, false);
                Vec::new()
            }
            Command::StartAccessPoint => {
                let up = self.link.start_access_point();
                self.engine.complete_link_attempt(up, true);
                Vec::new()
            }
            Command::Checkin { body } => {
                let api_key = self.engine.runtime().identity.api_key.clone();
                let result = self.channel.checkin(&body, &api_key).await;
                self.engine
                    .complete_checkin(result, platform::monotonic_ms(), platform::free_memory())
            }
            Command::ConnectBus(credentials) => {
                let connected = self.bus.connect(&credentials).await;
                self.engine.complete_bus_connect(connected);
                Vec::new()
            }
            Command::SubscribeBus { topic } => {
                let subscribed = self.bus.subscribe(&topic).await;
                self.engine.complete_bus_subscribe(subscribed)
            }
            Command::Publish {
                topic,
                message,
                retain,
            } => {
                self.bus.publish(&topic, &message, retain).await;
                Vec::new()
            }
            Command::PublishStatus { message, retain } => {
                self.bus.publish_status(&message, retain).await;
                Vec::new()
            }
            Command::SaveIdentity(identity) => {
                if let Err(err) = self.store.save(&identity).await {
                    // In-memory identity stays authoritative for the session.
                    warn!("identity persistence failed: {err}");
                }
                Vec::new()
            }
            Command::StartUpdate { reference } => {
                if let Some(hook) = self.hooks.on_firmware_update.as_mut() {
                    hook();
                }
                let result = self.updater.fetch_and_stage(&reference).await;
                self.engine.complete_update(result)
            }
            Command::Reboot(reason) => {
                self.bus.shutdown().await;
                platform::reboot(reason)
            }
            Command::RunFinalizeHook => {
                if let Some(hook) = self.hooks.on_finalize.as_mut() {
                    hook();
                }
                Vec::new()
            }
            Command::ForwardConfig(payload) => {
                if let Some(hook) = self.hooks.on_config_push.as_mut() {
                    hook(&payload);
                }
                Vec::new()
            }
            Command::MigrateCredentials { ssid, pass } => {
                if !self.link.migrate(&ssid, &pass).await {
                    // Migration failure means the old link may be gone too;
                    // let the monitor decide on the next pass.
                    debug!("credential migration left the link unverified");
                }
                Vec::new()
            }
        }
    }

    /// Drains broker traffic with a bounded budget so a chatty topic cannot
    /// starve the tick loop.
    async fn service_bus(&mut self) {
        if !self.bus.active() {
            return;
        }

        for _ in 0..BUS_SERVICE_BUDGET {
            let event =
                match tokio::time::timeout(Duration::from_millis(50), self.bus.poll()).await {
                    Ok(event) => event,
                    Err(_) => return,
                };

            match event {
                BusEvent::Inbound { topic, payload } => {
                    debug!(topic, bytes = payload.len(), "bus message");
                    if let Some(hook) = self.hooks.on_bus_message.as_mut() {
                        hook(&payload);
                    }
                    let commands = self.engine.handle_bus_message(
                        &payload,
                        platform::monotonic_ms(),
                        platform::free_memory(),
                    );
                    self.run_commands(commands).await;
                }
                BusEvent::Dropped => {
                    self.engine.bus_dropped();
                    return;
                }
                BusEvent::Connected | BusEvent::Idle => {}
            }
        }
    }
}

fn config_from_env() -> DeviceConfig {
    let mut config = DeviceConfig::default();

    if let Ok(api_key) = std::env::var("THINX_API_KEY") {
        config.api_key = api_key;
    }
    if let Ok(owner) = std::env::var("THINX_OWNER") {
        config.owner = owner;
    }
    if let Ok(alias) = std::env::var("THINX_ALIAS") {
        config.alias = alias;
    }
    if let Ok(host) = std::env::var("THINX_CLOUD_HOST") {
        config.cloud.mqtt_host = host.clone();
        config.cloud.host = host;
    }
    if let Ok(mqtt_host) = std::env::var("THINX_MQTT_HOST") {
        config.cloud.mqtt_host = mqtt_host;
    }
    if let Some(port) = env_parse::<u16>("THINX_API_PORT") {
        config.cloud.api_port = port;
    }
    if let Some(port) = env_parse::<u16>("THINX_MQTT_PORT") {
        config.cloud.mqtt_port = port;
    }
    if let Ok(value) = std::env::var("THINX_FORCE_HTTP") {
        config.cloud.force_http = value == "1" || value.eq_ignore_ascii_case("true");
    }
    if let Some(interval) = env_parse::<u64>("THINX_CHECKIN_INTERVAL_MS") {
        config.timing.checkin_interval_ms = interval;
    }
    if let Some(interval) = env_parse::<u64>("THINX_REBOOT_INTERVAL_MS") {
        config.timing.reboot_interval_ms = interval;
    }
    if let Ok(mac) = std::env::var("THINX_MAC") {
        config.mac = mac;
    }

    // Flash-chip id mirrors the MAC tail on targets without a discrete chip.
    if config.mac.len() >= 6 {
        config.fcid = config.mac[config.mac.len() - 6..].to_string();
    }

    config
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
