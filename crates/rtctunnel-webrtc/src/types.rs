//! Signal message codec and data-channel label grammar
//!
//! Signal messages are compact JSON with the exact field names `Type`, `SDP`
//! and `ICECandidates`; the whole message is sealed to the remote key before
//! it is handed to the signal. Data channels carry their destination port in
//! the label, `rtctunnel:<port>`.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// The three observable signal message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Offer,
    Answer,
    Reject,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::Reject => "reject",
        })
    }
}

/// A message exchanged over the signal while negotiating a peer connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "Type")]
    pub typ: MessageType,
    #[serde(rename = "SDP", default)]
    pub sdp: String,
    #[serde(
        rename = "ICECandidates",
        default,
        deserialize_with = "nullable_candidates"
    )]
    pub ice_candidates: Vec<RTCIceCandidateInit>,
}

// peers may encode an absent candidate list as null
fn nullable_candidates<'de, D>(deserializer: D) -> Result<Vec<RTCIceCandidateInit>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<RTCIceCandidateInit>>::deserialize(deserializer)?.unwrap_or_default())
}

/// The data-channel label carrying `port` as its multiplexing identifier.
pub fn channel_label(port: u16) -> String {
    format!("rtctunnel:{port}")
}

/// Parse a destination port out of a data-channel label. Only labels whose
/// prefix before the last `:` is exactly `rtctunnel` and whose suffix is a
/// decimal port are accepted.
pub fn parse_channel_label(label: &str) -> Option<u16> {
    let idx = label.rfind(':')?;
    if &label[..idx] != "rtctunnel" {
        return None;
    }
    label[idx + 1..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_roundtrip() {
        assert_eq!(parse_channel_label(&channel_label(0)), Some(0));
        assert_eq!(parse_channel_label(&channel_label(5000)), Some(5000));
        assert_eq!(parse_channel_label(&channel_label(65535)), Some(65535));
    }

    #[test]
    fn test_label_rejects_invalid() {
        for label in [
            "rtctunnel:",
            "rtctunnel:-1",
            "rtctunnel:abc",
            "rtctunnel:65536",
            "rtctunnel",
            "other:80",
            "rtctunnel:80:90",
            "",
        ] {
            assert_eq!(parse_channel_label(label), None, "label {label:?} accepted");
        }
    }

    #[test]
    fn test_message_wire_field_names() {
        let msg = SignalMessage {
            typ: MessageType::Offer,
            sdp: "v=0".to_string(),
            ice_candidates: vec![RTCIceCandidateInit {
                candidate: "candidate:1".to_string(),
                ..Default::default()
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(value["Type"], "offer");
        assert_eq!(value["SDP"], "v=0");
        assert_eq!(value["ICECandidates"][0]["candidate"], "candidate:1");
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = SignalMessage {
            typ: MessageType::Answer,
            sdp: "v=0\r\n".to_string(),
            ice_candidates: vec![RTCIceCandidateInit {
                candidate: "candidate:2".to_string(),
                ..Default::default()
            }],
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: SignalMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }

    #[test]
    fn test_message_accepts_null_candidates() {
        let decoded: SignalMessage =
            serde_json::from_str(r#"{"Type":"reject","SDP":"","ICECandidates":null}"#).unwrap();
        assert_eq!(decoded.typ, MessageType::Reject);
        assert!(decoded.ice_candidates.is_empty());
    }

    #[test]
    fn test_message_rejects_unknown_type() {
        assert!(serde_json::from_str::<SignalMessage>(r#"{"Type":"hello","SDP":""}"#).is_err());
    }
}
