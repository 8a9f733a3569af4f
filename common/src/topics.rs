pub fn device_channel(owner: &str, udid: &str) -> String {
    format!("/{owner}/{udid}")
}

pub fn device_channels(owner: &str, udid: &str) -> String {
    format!("/{owner}/{udid}/#")
}

pub fn status_channel(owner: &str, udid: &str) -> String {
    format!("/{owner}/{udid}/status")
}
