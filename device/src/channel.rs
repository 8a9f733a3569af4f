use std::time::Duration;

use anyhow::Context;

use thinx_common::protocol::{self, USER_AGENT};
use thinx_common::{ChannelError, DeviceConfig};

/// One-shot checkin exchanges against the registration endpoint. The client
/// skips certificate validation on purpose: the cloud rotates its certificate
/// frequently and the protocol's current revision does not pin it.
pub struct CloudChannel {
    client: reqwest::Client,
    endpoint: String,
    host: String,
}

impl CloudChannel {
    pub fn new(config: &DeviceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_millis(config.timing.checkin_timeout_ms))
            .build()
            .context("failed to build API client")?;

        let scheme = if config.cloud.force_http { "http" } else { "https" };
        let endpoint = format!(
            "{scheme}://{}:{}{}",
            config.cloud.host,
            config.cloud.active_api_port(),
            protocol::REGISTRATION_PATH
        );

        Ok(Self {
            client,
            endpoint,
            host: config.cloud.host.clone(),
        })
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Sends one checkin body and returns the raw response bytes. Failures map
    /// to the transient channel taxonomy; the controller retries later.
    pub async fn checkin(&self, body: &str, api_key: &str) -> Result<Vec<u8>, ChannelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Host", &self.host)
            .header("Authentication", api_key)
            .header("Accept", "application/json")
            .header("Origin", "device")
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .body(body.to_string())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ChannelError::Timeout
                } else if err.is_connect() {
                    ChannelError::Connect(err.to_string())
                } else {
                    ChannelError::Transport(err.to_string())
                }
            })?;

        let bytes = response
            .bytes()
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}
