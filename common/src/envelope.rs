use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Unknown,
    Update,
    Registration,
    Notification,
    Configuration,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Update => "update",
            Self::Registration => "registration",
            Self::Notification => "notification",
            Self::Configuration => "configuration",
        }
    }
}

// Scan order matches the reference protocol; selection is by greatest start
// offset, strictly-greater replacing. The offset rule is a wire-compatibility
// contract, not a preference.
const MARKER_TABLE: [(&[u8], MessageKind); 4] = [
    (b"{\"FIRMWARE_UPDATE\"", MessageKind::Update),
    (b"{\"registration\"", MessageKind::Registration),
    (b"{\"notification\"", MessageKind::Notification),
    (b"{\"configuration\"", MessageKind::Configuration),
];

const LEGACY_OWNER_MARKER: &[u8] = b"old_protocol_owner:-undefined-";
const OBJECT_TERMINATOR: &[u8] = b"}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: MessageKind,
    pub start: usize,
}

pub fn classify(payload: &[u8]) -> Classification {
    let mut kind = MessageKind::Unknown;
    let mut start: Option<usize> = None;

    for (marker, marker_kind) in MARKER_TABLE {
        if let Some(at) = find(payload, marker) {
            if start.map_or(true, |current| at > current) {
                start = Some(at);
                kind = marker_kind;
            }
        }
    }

    Classification {
        kind,
        start: start.unwrap_or(0),
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("response rejected: legacy-protocol owner not authorized")]
    LegacyOwner,
    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Ephemeral decoded view of one inbound payload. Lives only for the duration
/// of routing; never retained.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: MessageKind,
    pub body: Value,
}

impl Envelope {
    /// Classifies and decodes a raw payload. `Ok(None)` means no marker was
    /// found and the payload is to be dropped without effect.
    pub fn decode(payload: &[u8]) -> Result<Option<Envelope>, EnvelopeError> {
        let classification = classify(payload);
        if classification.kind == MessageKind::Unknown {
            return Ok(None);
        }

        if let Some(at) = find(payload, LEGACY_OWNER_MARKER) {
            if at > classification.start {
                return Err(EnvelopeError::LegacyOwner);
            }
        }

        let end = match classification.kind {
            MessageKind::Update => payload.len(),
            _ => find_from(payload, OBJECT_TERMINATOR, classification.start)
                .map(|at| at + OBJECT_TERMINATOR.len())
                .unwrap_or(payload.len()),
        };

        let body: Value = serde_json::from_slice(&payload[classification.start..end])?;
        Ok(Some(Envelope {
            kind: classification.kind,
            body,
        }))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    find(&haystack[from..], needle).map(|at| at + from)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn single_marker_classifies_by_kind() {
        let cases: [(&[u8], MessageKind); 4] = [
            (b"{\"registration\":{\"status\":\"OK\"}}", MessageKind::Registration),
            (b"{\"FIRMWARE_UPDATE\":{}}", MessageKind::Update),
            (b"{\"notification\":{\"response\":true}}", MessageKind::Notification),
            (b"{\"configuration\":{}}", MessageKind::Configuration),
        ];

        for (payload, expected) in cases {
            assert_eq!(classify(payload).kind, expected);
        }
    }

    #[test]
    fn no_marker_is_unknown() {
        assert_eq!(classify(b"{\"something\":\"else\"}").kind, MessageKind::Unknown);
        assert_eq!(classify(b"").kind, MessageKind::Unknown);
    }

    #[test]
    fn greatest_offset_marker_wins() {
        // Registration marker first, notification marker later: the later one
        // must win regardless of the scan declaration order.
        let payload = b"junkpad...{\"registration\":1}.....{\"notification\":{\"response\":true}}";
        assert_eq!(classify(payload).kind, MessageKind::Notification);

        // Reversed layout: registration now starts later and wins.
        let payload = b"{\"notification\":1}..padding..{\"registration\":{\"status\":\"OK\"}}";
        assert_eq!(classify(payload).kind, MessageKind::Registration);
    }

    #[test]
    fn greatest_offset_wins_across_all_pairs() {
        let markers: [(&str, MessageKind); 4] = [
            ("{\"FIRMWARE_UPDATE\"", MessageKind::Update),
            ("{\"registration\"", MessageKind::Registration),
            ("{\"notification\"", MessageKind::Notification),
            ("{\"configuration\"", MessageKind::Configuration),
        ];

        for (first, _) in markers {
            for (second, second_kind) in markers {
                if first == second {
                    continue;
                }
                let payload = format!("{first}:0}} filler {second}:0}}");
                assert_eq!(
                    classify(payload.as_bytes()).kind,
                    second_kind,
                    "latest marker must win in {payload}"
                );
            }
        }
    }

    #[test]
    fn classification_reports_marker_offset() {
        let payload = b"xxxx{\"registration\":{\"status\":\"OK\"}}";
        let classification = classify(payload);
        assert_eq!(classification.kind, MessageKind::Registration);
        assert_eq!(classification.start, 4);
    }

    #[test]
    fn decode_slices_from_marker() {
        let payload = b"HTTP noise\r\n\r\n{\"registration\":{\"status\":\"OK\"}}";
        let envelope = Envelope::decode(payload).unwrap().unwrap();
        assert_eq!(envelope.kind, MessageKind::Registration);
        assert_eq!(envelope.body["registration"]["status"], "OK");
    }

    #[test]
    fn decode_unknown_is_none() {
        assert!(Envelope::decode(b"plain text").unwrap().is_none());
    }

    #[test]
    fn decode_rejects_legacy_owner_past_marker() {
        let payload = b"{\"registration\":{}} old_protocol_owner:-undefined-";
        assert!(matches!(
            Envelope::decode(payload),
            Err(EnvelopeError::LegacyOwner)
        ));
    }

    #[test]
    fn decode_malformed_body_is_an_error() {
        let payload = b"{\"registration\":{\"status\" \"broken\"}}";
        assert!(matches!(
            Envelope::decode(payload),
            Err(EnvelopeError::Decode(_))
        ));
    }
}
