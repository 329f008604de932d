use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse form factor advertised alongside a device's display name.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
        }
    }
}

impl std::str::FromStr for DeviceClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceClass::Desktop),
            "mobile" => Ok(DeviceClass::Mobile),
            "tablet" => Ok(DeviceClass::Tablet),
            other => Err(format!("unknown device class {other:?}")),
        }
    }
}

/// Device description sent with `join`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    #[serde(rename = "type", default)]
    pub class: DeviceClass,
}

/// Roster entry announced by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub model: String,
    #[serde(rename = "type", default)]
    pub class: DeviceClass,
}

/// Messages sent from a device to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Register under a client-chosen id
    Join { sender: String, device: DeviceInfo },
    /// Forward `data` to the session named `to`; the relay never inspects `data`
    Signal {
        #[serde(alias = "target")]
        to: String,
        data: Value,
    },
    Ping,
    Pong,
}

/// Messages sent from the relay to a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    PeerJoined {
        peer: PeerInfo,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Signal {
        sender: String,
        data: Value,
    },
    Ping,
    Pong,
    Error {
        message: String,
    },
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Connection-setup payload carried inside `signal.data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NegotiationPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

impl NegotiationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationPayload::Offer { .. } => "offer",
            NegotiationPayload::Answer { .. } => "answer",
            NegotiationPayload::Candidate { .. } => "candidate",
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_uses_wire_field_names() {
        let msg = ClientMessage::Join {
            sender: "b7x".into(),
            device: DeviceInfo {
                model: "Skiff Core 12".into(),
                class: DeviceClass::Tablet,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "join",
                "sender": "b7x",
                "device": { "model": "Skiff Core 12", "type": "tablet" }
            })
        );
    }

    #[test]
    fn peer_left_uses_camel_case_id() {
        let msg = ServerMessage::PeerLeft {
            peer_id: "k2z".into(),
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"type":"peer-left","peerId":"k2z"}"#);
    }

    #[test]
    fn signal_accepts_target_alias() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"signal","target":"k2z","data":{"x":1}}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Signal {
                to: "k2z".into(),
                data: json!({"x": 1}),
            }
        );
    }

    #[test]
    fn candidate_payload_matches_browser_shape() {
        let payload = NegotiationPayload::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let value = payload.to_value().unwrap();
        assert_eq!(value["type"], "candidate");
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(NegotiationPayload::from_value(&value).unwrap(), payload);
    }

    #[test]
    fn unknown_payload_kind_is_rejected() {
        let err = NegotiationPayload::from_value(&json!({"type": "rollback"}));
        assert!(err.is_err());
    }

    #[test]
    fn device_class_defaults_to_desktop() {
        let peer: PeerInfo = serde_json::from_str(r#"{"id":"a","model":"m"}"#).unwrap();
        assert_eq!(peer.class, DeviceClass::Desktop);
        assert_eq!("Mobile".parse::<DeviceClass>(), Ok(DeviceClass::Mobile));
    }
}
