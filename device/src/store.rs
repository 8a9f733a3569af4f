use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::warn;

use thinx_common::{DeviceIdentity, RestoreOutcome, StoreError};

const IDENTITY_FILE: &str = "thinx.cfg";

/// File-backed identity store. The record format and its tolerance rules live
/// in `thinx_common::identity`; this only moves bytes.
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new() -> Self {
        let data_dir = std::env::var("THINX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.thinx"));
        Self {
            path: data_dir.join(IDENTITY_FILE),
        }
    }

    pub async fn restore(&self) -> RestoreOutcome {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => DeviceIdentity::decode_stored(&raw),
            Err(err) if err.kind() == ErrorKind::NotFound => RestoreOutcome::NotFound,
            Err(err) => {
                // An unreadable store falls back to in-memory identity.
                warn!("identity store unreadable: {err}");
                RestoreOutcome::NotFound
            }
        }
    }

    pub async fn save(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = identity.encode_stored()?;
        tokio::fs::write(&self.path, payload).await?;
        Ok(())
    }
}
