use serde_json::Value;
use tracing::{info, warn};

use crate::envelope::{Envelope, MessageKind};
use crate::identity::{NAME_MIN_LEN, UDID_MIN_LEN};
use crate::lifecycle::{Command, DeviceRuntime, RebootReason};
use crate::protocol::{self, NotificationSection, RegistrationSection};
use crate::update;

// Wire-level significance thresholds, as the protocol has always applied them.
const LEGACY_REF_MIN_LEN: usize = 3;
const REFERENCE_MIN_LEN: usize = 5;
const SSID_MIN_LEN: usize = 3;

/// Classifies one raw payload (checkin response or inbound bus publish) and
/// dispatches it to the matching handler. Unknown or undecodable payloads are
/// dropped with no state change.
pub fn route(
    runtime: &mut DeviceRuntime,
    payload: &[u8],
    now_ms: u64,
    free_memory: u64,
) -> Vec<Command> {
    // Refusing to decode beats running out of memory halfway through.
    if free_memory < payload.len() as u64 {
        warn!(
            payload_len = payload.len(),
            free_memory, "not enough memory to parse response, dropping"
        );
        return Vec::new();
    }

    let envelope = match Envelope::decode(payload) {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return Vec::new(),
        Err(err) => {
            warn!("response dropped: {err}");
            return Vec::new();
        }
    };

    match envelope.kind {
        MessageKind::Registration => handle_registration(runtime, &envelope.body, now_ms),
        MessageKind::Update => handle_update(runtime, &envelope.body),
        MessageKind::Notification => handle_notification(runtime, &envelope.body),
        MessageKind::Configuration => handle_configuration(&envelope.body),
        MessageKind::Unknown => Vec::new(),
    }
}

fn section_view(body: &Value, key: &str) -> Option<RegistrationSection> {
    let value = body.get(key)?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

fn handle_registration(runtime: &mut DeviceRuntime, body: &Value, now_ms: u64) -> Vec<Command> {
    let Some(section) = section_view(body, "registration") else {
        warn!("failed parsing registration node");
        return Vec::new();
    };

    match section.status.as_str() {
        "OK" => {
            if section.alias.len() >= NAME_MIN_LEN {
                runtime.identity.alias = section.alias;
            }
            if section.owner.len() >= NAME_MIN_LEN {
                runtime.identity.owner = section.owner;
            }
            if section.udid.len() >= UDID_MIN_LEN {
                runtime.identity.udid = section.udid;
            }
            if let Some(auto_update) = section.auto_update {
                runtime.auto_update = auto_update;
            }
            if let Some(forced_update) = section.forced_update {
                runtime.forced_update = forced_update;
            }
            if let Some(timestamp) = section.timestamp {
                runtime.last_checkin_timestamp =
                    timestamp + runtime.config.timezone_offset_hours * 3_600;
                runtime.last_checkin_ms = now_ms;
            }
            vec![Command::SaveIdentity(runtime.identity.clone())]
        }
        "FIRMWARE_UPDATE" => handle_legacy_update(runtime, section),
        _ => Vec::new(),
    }
}

// Pre-2.7 servers announce updates through the registration status. Kept for
// fleet compatibility.
fn handle_legacy_update(runtime: &mut DeviceRuntime, section: RegistrationSection) -> Vec<Command> {
    if section.udid.len() >= UDID_MIN_LEN {
        runtime.identity.udid = section.udid.clone();
    }
    let mut commands = vec![Command::SaveIdentity(runtime.identity.clone())];

    if !section.version.is_empty()
        && section.version == runtime.config.build.firmware_version_short
    {
        // The announced build is already running.
        return commands;
    }

    if !runtime.auto_update {
        info!("skipping legacy update (automatic updates disabled)");
        return commands;
    }

    let mut reference = String::new();
    if section.url.len() >= LEGACY_REF_MIN_LEN {
        reference = section.url.clone();
    }
    if section.ott.len() >= LEGACY_REF_MIN_LEN {
        reference = update::ott_reference(&section.ott);
    }

    if reference.is_empty() {
        // Nothing fetchable in-session; the classic flow restarts and
        // re-registers into the update.
        commands.push(Command::Reboot(RebootReason::LegacyUpdate));
        return commands;
    }

    runtime.deferred_update = update::normalize_reference(&reference, &runtime.config.cloud);
    commands
}

fn handle_update(runtime: &mut DeviceRuntime, body: &Value) -> Vec<Command> {
    let Some(section) =
        section_view(body, "registration").or_else(|| section_view(body, "FIRMWARE_UPDATE"))
    else {
        warn!("failed parsing update node");
        return Vec::new();
    };

    if section.udid.len() >= UDID_MIN_LEN {
        runtime.identity.udid = section.udid.clone();
    }
    if let Some(auto_update) = section.auto_update {
        runtime.auto_update = auto_update;
    }

    // Version equality short-circuits: the reported build is the running one,
    // so any stored reference is stale and the update loop is closed.
    let running = runtime.config.build.firmware_version_short.clone();
    if !section.version.is_empty() && section.version.starts_with(running.as_str()) {
        if !section.env_hash.is_empty()
            && !section.env_hash.contains(&runtime.config.build.env_hash)
        {
            info!("environment hash differs but firmware version matches, not updating");
        }
        runtime.available_update.clear();
        runtime.deferred_update.clear();
        runtime.identity.pending_update.clear();
        return vec![Command::PublishStatus {
            message: protocol::UPDATE_SUCCESS_NOTIFICATION.to_string(),
            retain: false,
        }];
    }

    let mut commands = vec![Command::SaveIdentity(runtime.identity.clone())];

    if !runtime.auto_update && !runtime.forced_update {
        // Ask the user to commence the update instead.
        commands.push(Command::Publish {
            topic: runtime.device_channel(),
            message: protocol::UPDATE_AVAILABLE_NOTIFICATION.to_string(),
            retain: false,
        });
        return commands;
    }

    let mut reference = String::new();
    if section.url.len() >= REFERENCE_MIN_LEN {
        reference = section.url.clone();
    }
    if section.ott.len() >= REFERENCE_MIN_LEN {
        reference = update::ott_reference(&section.ott);
    }
    if reference.len() < REFERENCE_MIN_LEN {
        return commands;
    }

    let bare = update::normalize_reference(&reference, &runtime.config.cloud);
    runtime.available_update = bare.clone();
    runtime.identity.pending_update = bare.clone();
    runtime.deferred_update = bare;
    commands.push(Command::PublishStatus {
        message: protocol::STATUS_UPDATE_STARTED.to_string(),
        retain: false,
    });
    commands
}

fn handle_notification(runtime: &mut DeviceRuntime, body: &Value) -> Vec<Command> {
    let section: NotificationSection = match body.get("notification") {
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(section) => section,
            Err(err) => {
                warn!("failed parsing notification node: {err}");
                return Vec::new();
            }
        },
        None => {
            warn!("failed parsing notification node");
            return Vec::new();
        }
    };

    let approved = match section.response_type.as_str() {
        "bool" | "boolean" => section.response.as_bool() == Some(true),
        "string" | "String" => section.response.as_str() == Some("yes"),
        _ => false,
    };

    if approved {
        if runtime.available_update.len() >= REFERENCE_MIN_LEN {
            info!("update approved, promoting stored reference");
            runtime.deferred_update = runtime.available_update.clone();
        }
    }

    Vec::new()
}

fn handle_configuration(body: &Value) -> Vec<Command> {
    let Some(section) = body.get("configuration").and_then(Value::as_object) else {
        warn!("failed parsing configuration node");
        return Vec::new();
    };

    let mut commands = Vec::new();

    let ssid = section
        .get(protocol::ENV_SSID_KEY)
        .and_then(Value::as_str)
        .unwrap_or("");
    let pass = section
        .get(protocol::ENV_PASS_KEY)
        .and_then(Value::as_str)
        .unwrap_or("");
    // The password may be short, but not absent.
    if ssid.len() >= SSID_MIN_LEN && !pass.is_empty() {
        commands.push(Command::MigrateCredentials {
            ssid: ssid.to_string(),
            pass: pass.to_string(),
        });
    }

    // The full configuration body goes to the library user.
    match serde_json::to_string(body) {
        Ok(raw) => commands.push(Command::ForwardConfig(raw)),
        Err(err) => warn!("configuration forward failed: {err}"),
    }

    commands
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::DeviceConfig;

    const AMPLE_MEMORY: u64 = 1_000_000;
    const UDID: &str = "11111111-1111-1111-1111-111111111111";

    fn test_runtime() -> DeviceRuntime {
        DeviceRuntime::new(DeviceConfig {
            api_key: "key1234".to_string(),
            owner: "A".repeat(36),
            ..DeviceConfig::default()
        })
    }

    #[test]
    fn first_registration_assigns_udid_and_flags() {
        let mut runtime = test_runtime();
        assert!(runtime.identity.udid.is_empty());

        let payload = format!(
            "{{\"registration\":{{\"status\":\"OK\",\"udid\":\"{UDID}\",\"auto_update\":true}}}}"
        );
        let commands = route(&mut runtime, payload.as_bytes(), 5_000, AMPLE_MEMORY);

        assert_eq!(runtime.identity.udid, UDID);
        assert!(runtime.auto_update);
        assert_eq!(
            commands,
            vec![Command::SaveIdentity(runtime.identity.clone())]
        );

        // The next checkin body carries the assigned udid.
        let body = runtime.checkin_request().to_json().unwrap();
        assert!(body.contains(&format!("\"udid\":\"{UDID}\"")));
    }

    #[test]
    fn registration_fields_below_min_length_are_ignored() {
        let mut runtime = test_runtime();
        let owner_before = runtime.identity.owner.clone();

        let payload =
            b"{\"registration\":{\"status\":\"OK\",\"alias\":\"x\",\"owner\":\"y\",\"udid\":\"abc\"}}";
        let _ = route(&mut runtime, payload, 0, AMPLE_MEMORY);

        assert_eq!(runtime.identity.owner, owner_before);
        assert_eq!(runtime.identity.alias, "unnamed");
        assert!(runtime.identity.udid.is_empty());
    }

    #[test]
    fn registration_timestamp_applies_timezone_offset() {
        let mut runtime = test_runtime();
        runtime.config.timezone_offset_hours = 2;

        let payload = b"{\"registration\":{\"status\":\"OK\",\"timestamp\":1000000}}";
        let _ = route(&mut runtime, payload, 42_000, AMPLE_MEMORY);

        assert_eq!(runtime.last_checkin_timestamp, 1_000_000 + 7_200);
        assert_eq!(runtime.last_checkin_ms, 42_000);
    }

    #[test]
    fn greatest_offset_marker_selects_the_handler() {
        let mut runtime = test_runtime();
        runtime.available_update = "/bin/fw.bin".to_string();

        // Registration marker at a low offset, notification at a higher one:
        // only the notification handler may run.
        let payload = format!(
            "{{\"registration\":{{\"status\":\"OK\",\"udid\":\"{UDID}\"}}}}  {{\"notification\":{{\"response_type\":\"bool\",\"response\":true}}}}"
        );
        let _ = route(&mut runtime, payload.as_bytes(), 0, AMPLE_MEMORY);

        assert!(runtime.identity.udid.is_empty(), "registration must not run");
        assert_eq!(runtime.deferred_update, "/bin/fw.bin");
    }

    #[test]
    fn version_equality_never_schedules_an_update() {
        let mut runtime = test_runtime();
        let version = runtime.config.build.firmware_version_short.clone();
        runtime.available_update = "/stale.bin".to_string();
        runtime.deferred_update = "/stale.bin".to_string();

        let payload = format!(
            "{{\"FIRMWARE_UPDATE\":{{}},\"registration\":{{\"version\":\"{version}\",\"url\":\"http://thinx.cloud:7442/bin/new.bin\"}}}}"
        );
        let commands = route(&mut runtime, payload.as_bytes(), 0, AMPLE_MEMORY);

        assert!(runtime.deferred_update.is_empty());
        assert!(runtime.available_update.is_empty());
        assert_eq!(
            commands,
            vec![Command::PublishStatus {
                message: protocol::UPDATE_SUCCESS_NOTIFICATION.to_string(),
                retain: false,
            }]
        );
    }

    #[test]
    fn update_with_new_version_defers_a_bare_path() {
        let mut runtime = test_runtime();

        let payload = b"{\"FIRMWARE_UPDATE\":{},\"registration\":{\"version\":\"9.9.9\",\"url\":\"http://thinx.cloud:7442/bin/new.bin\"}}";
        let commands = route(&mut runtime, payload, 0, AMPLE_MEMORY);

        assert_eq!(runtime.deferred_update, "/bin/new.bin");
        assert_eq!(runtime.available_update, "/bin/new.bin");
        assert_eq!(runtime.identity.pending_update, "/bin/new.bin");
        assert_eq!(
            commands.last(),
            Some(&Command::PublishStatus {
                message: protocol::STATUS_UPDATE_STARTED.to_string(),
                retain: false,
            })
        );
    }

    #[test]
    fn update_prefers_ott_over_direct_url() {
        let mut runtime = test_runtime();

        let payload = b"{\"FIRMWARE_UPDATE\":{},\"registration\":{\"version\":\"9.9.9\",\"url\":\"/bin/new.bin\",\"ott\":\"token-42\"}}";
        let _ = route(&mut runtime, payload, 0, AMPLE_MEMORY);

        assert_eq!(runtime.deferred_update, "/device/firmware?ott=token-42");
    }

    #[test]
    fn update_with_auto_update_disabled_asks_the_user() {
        let mut runtime = test_runtime();
        runtime.auto_update = false;
        runtime.identity.udid = UDID.to_string();

        let payload = b"{\"FIRMWARE_UPDATE\":{},\"registration\":{\"version\":\"9.9.9\",\"url\":\"/bin/new.bin\"}}";
        let commands = route(&mut runtime, payload, 0, AMPLE_MEMORY);

        assert!(runtime.deferred_update.is_empty());
        assert_eq!(
            commands.last(),
            Some(&Command::Publish {
                topic: runtime.device_channel(),
                message: protocol::UPDATE_AVAILABLE_NOTIFICATION.to_string(),
                retain: false,
            })
        );
    }

    #[test]
    fn legacy_update_with_equal_version_is_a_no_op() {
        let mut runtime = test_runtime();
        let version = runtime.config.build.firmware_version_short.clone();

        let payload = format!(
            "{{\"registration\":{{\"status\":\"FIRMWARE_UPDATE\",\"version\":\"{version}\",\"url\":\"/bin/new.bin\"}}}}"
        );
        let commands = route(&mut runtime, payload.as_bytes(), 0, AMPLE_MEMORY);

        assert!(runtime.deferred_update.is_empty());
        assert_eq!(
            commands,
            vec![Command::SaveIdentity(runtime.identity.clone())]
        );
    }

    #[test]
    fn legacy_update_resolves_url_and_ott() {
        let mut runtime = test_runtime();
        let payload =
            b"{\"registration\":{\"status\":\"FIRMWARE_UPDATE\",\"version\":\"9.9.9\",\"url\":\"http://thinx.cloud:7442/bin/new.bin\"}}";
        let _ = route(&mut runtime, payload, 0, AMPLE_MEMORY);
        assert_eq!(runtime.deferred_update, "/bin/new.bin");

        let mut runtime = test_runtime();
        let payload =
            b"{\"registration\":{\"status\":\"FIRMWARE_UPDATE\",\"version\":\"9.9.9\",\"ott\":\"tok\"}}";
        let _ = route(&mut runtime, payload, 0, AMPLE_MEMORY);
        assert_eq!(runtime.deferred_update, "/device/firmware?ott=tok");
    }

    #[test]
    fn legacy_update_without_reference_signals_reboot() {
        let mut runtime = test_runtime();
        let payload =
            b"{\"registration\":{\"status\":\"FIRMWARE_UPDATE\",\"version\":\"9.9.9\"}}";
        let commands = route(&mut runtime, payload, 0, AMPLE_MEMORY);

        assert_eq!(
            commands.last(),
            Some(&Command::Reboot(RebootReason::LegacyUpdate))
        );
    }

    #[test]
    fn notification_consent_promotes_available_reference() {
        for (response_type, response, expected) in [
            ("bool", "true", true),
            ("boolean", "true", true),
            ("bool", "false", false),
            ("string", "\"yes\"", true),
            ("String", "\"yes\"", true),
            ("string", "\"no\"", false),
            ("other", "true", false),
        ] {
            let mut runtime = test_runtime();
            runtime.available_update = "/bin/fw.bin".to_string();

            let payload = format!(
                "{{\"notification\":{{\"response_type\":\"{response_type}\",\"response\":{response}}}}}"
            );
            let _ = route(&mut runtime, payload.as_bytes(), 0, AMPLE_MEMORY);

            let promoted = !runtime.deferred_update.is_empty();
            assert_eq!(
                promoted, expected,
                "response_type={response_type} response={response}"
            );
        }
    }

    #[test]
    fn notification_consent_without_stored_reference_is_inert() {
        let mut runtime = test_runtime();
        let payload = b"{\"notification\":{\"response_type\":\"bool\",\"response\":true}}";
        let _ = route(&mut runtime, payload, 0, AMPLE_MEMORY);
        assert!(runtime.deferred_update.is_empty());
    }

    #[test]
    fn configuration_with_credentials_migrates_and_forwards() {
        let mut runtime = test_runtime();
        let payload = b"{\"configuration\":{\"THINX_ENV_SSID\":\"lab-net\",\"THINX_ENV_PASS\":\"s3cret\",\"CUSTOM\":\"1\"}}";
        let commands = route(&mut runtime, payload, 0, AMPLE_MEMORY);

        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            Command::MigrateCredentials {
                ssid: "lab-net".to_string(),
                pass: "s3cret".to_string(),
            }
        );
        match &commands[1] {
            Command::ForwardConfig(raw) => assert!(raw.contains("CUSTOM")),
            other => panic!("expected ForwardConfig, got {other:?}"),
        }
    }

    #[test]
    fn configuration_without_credentials_only_forwards() {
        let mut runtime = test_runtime();
        let payload = b"{\"configuration\":{\"KEY\":\"value\"}}";
        let commands = route(&mut runtime, payload, 0, AMPLE_MEMORY);

        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::ForwardConfig(_)));
    }

    #[test]
    fn low_memory_drops_payload_without_effect() {
        let mut runtime = test_runtime();
        let payload = format!("{{\"registration\":{{\"status\":\"OK\",\"udid\":\"{UDID}\"}}}}");

        let commands = route(&mut runtime, payload.as_bytes(), 0, 10);

        assert!(commands.is_empty());
        assert!(runtime.identity.udid.is_empty());
    }

    #[test]
    fn malformed_body_leaves_state_untouched() {
        let mut runtime = test_runtime();
        let before = runtime.identity.clone();

        let payload = b"{\"registration\":{\"status\" broken}}";
        let commands = route(&mut runtime, payload, 0, AMPLE_MEMORY);

        assert!(commands.is_empty());
        assert_eq!(runtime.identity, before);
    }

    #[test]
    fn unknown_payload_is_a_no_op() {
        let mut runtime = test_runtime();
        let commands = route(&mut runtime, b"{\"noise\":1}", 0, AMPLE_MEMORY);
        assert!(commands.is_empty());
    }

    #[test]
    fn legacy_owner_marker_rejects_the_response() {
        let mut runtime = test_runtime();
        let payload =
            b"{\"registration\":{\"status\":\"OK\",\"udid\":\"11111111-1111-1111-1111-111111111111\"}} old_protocol_owner:-undefined-";
        let commands = route(&mut runtime, payload, 0, AMPLE_MEMORY);

        assert!(commands.is_empty());
        assert!(runtime.identity.udid.is_empty());
    }
}
