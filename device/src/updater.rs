use std::path::PathBuf;

use tracing::info;

use thinx_common::DeviceConfig;

const STAGING_FILE: &str = "firmware.bin";

/// Fetches a firmware image identified by a bare reference path (or OTT
/// query) and stages it for the next boot. Image hash validation is not part
/// of the protocol's current revision.
pub struct FirmwareUpdater {
    client: reqwest::Client,
    base_url: String,
    staging_path: PathBuf,
}

impl FirmwareUpdater {
    pub fn new(config: &DeviceConfig, client: reqwest::Client) -> Self {
        let scheme = if config.cloud.force_http { "http" } else { "https" };
        let base_url = format!(
            "{scheme}://{}:{}",
            config.cloud.host,
            config.cloud.active_api_port()
        );

        let data_dir = std::env::var("THINX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.thinx"));

        Self {
            client,
            base_url,
            staging_path: data_dir.join(STAGING_FILE),
        }
    }

    pub async fn fetch_and_stage(&self, reference: &str) -> Result<(), String> {
        let url = if reference.starts_with("http://") || reference.starts_with("https://") {
            reference.to_string()
        } else if reference.starts_with('/') {
            format!("{}{reference}", self.base_url)
        } else {
            format!("{}/{reference}", self.base_url)
        };

        info!(url, "fetching firmware image");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("firmware fetch failed: {err}"))?;

        if !response.status().is_success() {
            return Err(format!("firmware fetch returned {}", response.status()));
        }

        let image = response
            .bytes()
            .await
            .map_err(|err| format!("firmware download failed: {err}"))?;
        if image.is_empty() {
            return Err("firmware image is empty".to_string());
        }

        if let Some(parent) = self.staging_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| format!("firmware staging failed: {err}"))?;
        }
        tokio::fs::write(&self.staging_path, &image)
            .await
            .map_err(|err| format!("firmware staging failed: {err}"))?;

        info!(
            bytes = image.len(),
            path = %self.staging_path.display(),
            "firmware image staged"
        );
        Ok(())
    }
}
