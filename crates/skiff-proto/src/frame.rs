use serde::{Deserialize, Serialize};

/// Announces the file whose payload chunks follow on the same channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferHeader {
    pub name: String,
    pub size: u64,
    #[serde(default = "default_mime")]
    pub mime: String,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

/// Text-encoded control frames. Payload chunks travel as raw binary frames
/// and carry no tag at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Header(TransferHeader),
}

impl ControlFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_flat_json() {
        let frame = ControlFrame::Header(TransferHeader {
            name: "notes.txt".into(),
            size: 40960,
            mime: "text/plain".into(),
        });
        assert_eq!(
            frame.encode().unwrap(),
            r#"{"type":"header","name":"notes.txt","size":40960,"mime":"text/plain"}"#
        );
    }

    #[test]
    fn missing_mime_falls_back_to_octet_stream() {
        let frame = ControlFrame::decode(r#"{"type":"header","name":"a.bin","size":3}"#).unwrap();
        let ControlFrame::Header(header) = frame;
        assert_eq!(header.mime, "application/octet-stream");
    }

    #[test]
    fn chunk_like_text_is_not_a_control_frame() {
        assert!(ControlFrame::decode(r#"{"type":"chunk","chunk":"AAAA"}"#).is_err());
    }
}
