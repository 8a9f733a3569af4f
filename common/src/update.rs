use crate::config::CloudConfig;
use crate::protocol;

/// What to do with a deferred update reference this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Nothing pending.
    Idle,
    /// Enough headroom to fetch and flash; begin the update.
    Start(String),
    /// A reference is pending but memory is critically low. Restarting is
    /// preferred over a flash attempt that could corrupt the device.
    Reboot,
}

pub fn maybe_apply(deferred_ref: &str, free_memory: u64, floor_bytes: u64) -> UpdateDecision {
    if deferred_ref.is_empty() {
        return UpdateDecision::Idle;
    }
    if free_memory > floor_bytes {
        UpdateDecision::Start(deferred_ref.to_string())
    } else {
        UpdateDecision::Reboot
    }
}

/// Reduces a server-supplied update URL to a bare path: scheme, known cloud
/// host and the registration ports are stripped so the stored reference stays
/// valid regardless of which transport later fetches it.
pub fn normalize_reference(reference: &str, cloud: &CloudConfig) -> String {
    let mut bare = reference.replace("http://", "").replace("https://", "");
    bare = bare.replace(&format!(":{}", cloud.insecure_api_port), "");
    bare = bare.replace(&format!(":{}", cloud.api_port), "");
    bare.replace(&cloud.host, "")
}

pub fn ott_reference(ott: &str) -> String {
    format!("{}?ott={ott}", protocol::FIRMWARE_PATH)
}
