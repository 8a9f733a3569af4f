use serde::{Deserialize, Serialize};
use thiserror::Error;

// Field significance thresholds carried over from the wire protocol:
// owner/alias need at least two characters, credentials and udid at least five.
pub const NAME_MIN_LEN: usize = 2;
pub const API_KEY_MIN_LEN: usize = 5;
pub const UDID_MIN_LEN: usize = 5;

/// The only device state that survives a reboot. Persisted as a single JSON
/// object; every key is written only when non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(rename = "apikey", default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub udid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(rename = "update", default, skip_serializing_if = "String::is_empty")]
    pub pending_update: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Found(DeviceIdentity),
    NotFound,
    Corrupt,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("identity store i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceIdentity {
    pub fn has_api_key(&self) -> bool {
        self.api_key.len() >= API_KEY_MIN_LEN
    }

    pub fn has_udid(&self) -> bool {
        self.udid.len() >= UDID_MIN_LEN
    }

    /// Decodes a previously stored record. A store that was never written, or
    /// that holds anything other than a brace-balanced JSON object, restores
    /// as no identity rather than an error; balanced-but-unparsable content is
    /// reported as corrupt. In-memory state is never touched here.
    pub fn decode_stored(raw: &[u8]) -> RestoreOutcome {
        let framed = match raw.iter().position(|&byte| byte == b'\r') {
            Some(end) => &raw[..end],
            None => raw,
        };

        if framed.is_empty() || framed[0] != b'{' {
            return RestoreOutcome::NotFound;
        }
        if !braces_balanced(framed) {
            return RestoreOutcome::NotFound;
        }

        match serde_json::from_slice::<DeviceIdentity>(framed) {
            Ok(identity) => RestoreOutcome::Found(identity),
            Err(_) => RestoreOutcome::Corrupt,
        }
    }

    /// Full-overwrite encoding, terminated with CR+LF for the
    /// filesystem-backed store.
    pub fn encode_stored(&self) -> Result<Vec<u8>, StoreError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.extend_from_slice(b"\r\n");
        Ok(bytes)
    }
}

fn braces_balanced(raw: &[u8]) -> bool {
    let mut depth: i32 = 0;
    for &byte in raw {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> DeviceIdentity {
        DeviceIdentity {
            owner: "a".repeat(36),
            api_key: "key1234".to_string(),
            udid: "11111111-1111-1111-1111-111111111111".to_string(),
            alias: "bedroom-lamp".to_string(),
            pending_update: String::new(),
        }
    }

    #[test]
    fn restore_after_save_roundtrips_non_empty_fields() {
        let identity = sample();
        let stored = identity.encode_stored().unwrap();

        assert_eq!(
            DeviceIdentity::decode_stored(&stored),
            RestoreOutcome::Found(identity)
        );
    }

    #[test]
    fn stored_record_ends_with_cr_lf_and_skips_empty_keys() {
        let stored = sample().encode_stored().unwrap();
        let text = std::str::from_utf8(&stored).unwrap();

        assert!(text.ends_with("\r\n"));
        assert!(!text.contains("update"));
        assert!(text.contains("apikey"));
    }

    #[test]
    fn restore_stops_at_first_carriage_return() {
        let mut stored = sample().encode_stored().unwrap();
        stored.extend_from_slice(b"trailing garbage after the frame");

        assert_eq!(
            DeviceIdentity::decode_stored(&stored),
            RestoreOutcome::Found(sample())
        );
    }

    #[test]
    fn non_brace_prefix_restores_as_not_found() {
        for raw in [
            &b"not json at all"[..],
            &b"[1,2,3]"[..],
            &b" {\"owner\":\"x\"}"[..],
            &b""[..],
        ] {
            assert_eq!(DeviceIdentity::decode_stored(raw), RestoreOutcome::NotFound);
        }
    }

    #[test]
    fn unbalanced_braces_restore_as_not_found() {
        for raw in [
            &b"{\"owner\":\"x\""[..],
            &b"{{}"[..],
            &b"{}}"[..],
            &b"{\"a\":{\"b\":1}"[..],
        ] {
            assert_eq!(DeviceIdentity::decode_stored(raw), RestoreOutcome::NotFound);
        }
    }

    #[test]
    fn balanced_but_unparsable_restores_as_corrupt() {
        assert_eq!(
            DeviceIdentity::decode_stored(b"{broken but balanced}"),
            RestoreOutcome::Corrupt
        );
        assert_eq!(
            DeviceIdentity::decode_stored(b"{\"apikey\": 17}"),
            RestoreOutcome::Corrupt
        );
    }

    #[test]
    fn significance_thresholds() {
        let mut identity = DeviceIdentity::default();
        assert!(!identity.has_api_key());
        assert!(!identity.has_udid());

        identity.api_key = "abcd".to_string();
        identity.udid = "0".to_string();
        assert!(!identity.has_api_key());
        assert!(!identity.has_udid());

        identity.api_key = "abcde".to_string();
        identity.udid = "u-123".to_string();
        assert!(identity.has_api_key());
        assert!(identity.has_udid());
    }
}
