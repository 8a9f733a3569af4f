use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, LastWill, MqttOptions, QoS};
use tracing::{debug, warn};

use thinx_common::{BusCredentials, DeviceConfig};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum BusEvent {
    Connected,
    Inbound { topic: String, payload: Vec<u8> },
    Dropped,
    Idle,
}

struct Session {
    client: AsyncClient,
    eventloop: rumqttc::EventLoop,
    connected: bool,
}

/// Persistent broker session. Authenticates with `(udid, apiKey)`, registers
/// the device's last will on its status topic and surfaces inbound publishes
/// for routing.
pub struct MessageBus {
    host: String,
    port: u16,
    reconnect_timeout: Duration,
    credentials: Option<BusCredentials>,
    session: Option<Session>,
}

impl MessageBus {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            host: config.cloud.mqtt_host.clone(),
            port: config.cloud.mqtt_port,
            reconnect_timeout: Duration::from_millis(config.timing.bus_reconnect_timeout_ms),
            credentials: None,
            session: None,
        }
    }

    pub fn active(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|session| session.connected)
    }

    /// Establishes a fresh session, waiting for the broker's acknowledgment
    /// within the reconnect bound. A previous session, if any, is dropped.
    pub async fn connect(&mut self, credentials: &BusCredentials) -> bool {
        let mut options = MqttOptions::new(&credentials.client_id, &self.host, self.port);
        options.set_credentials(&credentials.username, &credentials.password);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_last_will(LastWill::new(
            &credentials.status_topic,
            credentials.last_will.clone(),
            QoS::AtLeastOnce,
            false,
        ));

        let (client, eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        let mut session = Session {
            client,
            eventloop,
            connected: false,
        };

        let connected = tokio::time::timeout(self.reconnect_timeout, async {
            loop {
                match session.eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        return ack.code == ConnectReturnCode::Success;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("bus connect failed: {err}");
                        return false;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            warn!("bus connect timed out");
            false
        });

        session.connected = connected;
        self.credentials = Some(credentials.clone());
        self.session = Some(session);
        connected
    }

    pub async fn subscribe(&mut self, topic: &str) -> bool {
        let Some(session) = self.session.as_ref().filter(|session| session.connected) else {
            return false;
        };
        match session.client.subscribe(topic, QoS::AtMostOnce).await {
            Ok(()) => true,
            Err(err) => {
                warn!("bus subscribe failed: {err}");
                false
            }
        }
    }

    /// Drives the session. Must be polled continuously while a session exists;
    /// a session-less bus never resolves.
    pub async fn poll(&mut self) -> BusEvent {
        match self.session.as_mut() {
            Some(session) => match session.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => BusEvent::Inbound {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    session.connected = ack.code == ConnectReturnCode::Success;
                    BusEvent::Connected
                }
                Ok(_) => BusEvent::Idle,
                Err(err) => {
                    warn!("bus poll error: {err}");
                    session.connected = false;
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    BusEvent::Dropped
                }
            },
            None => std::future::pending().await,
        }
    }

    /// Plain publish; silently dropped when the session is down.
    pub async fn publish(&mut self, topic: &str, message: &str, retain: bool) -> bool {
        let Some(session) = self.session.as_ref().filter(|session| session.connected) else {
            debug!(topic, "bus not connected, dropping publish");
            return false;
        };
        match session
            .client
            .publish(topic, QoS::AtLeastOnce, retain, message.as_bytes().to_vec())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!("bus publish failed: {err}");
                false
            }
        }
    }

    /// Status-topic publish. Unlike `publish`, a dead session gets one bounded
    /// reconnect attempt before the message is dropped.
    pub async fn publish_status(&mut self, message: &str, retain: bool) -> bool {
        if !self.is_connected() {
            let Some(credentials) = self.credentials.clone() else {
                debug!("bus never configured, dropping status publish");
                return false;
            };
            warn!("bus disconnected, reconnecting for status publish");
            if !self.connect(&credentials).await {
                return false;
            }
        }

        let Some(topic) = self
            .credentials
            .as_ref()
            .map(|credentials| credentials.status_topic.clone())
        else {
            return false;
        };
        self.publish(&topic, message, retain).await
    }

    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.as_ref() {
            let _ = session.client.disconnect().await;
        }
        self.session = None;
    }
}
