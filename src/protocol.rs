//! Wire messages exchanged with devices

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::{Error, Result};

/// Audio encoding announced to clients
pub const AUDIO_FORMAT: &str = "opus";

/// Control message from a device
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opening handshake
    Hello(Hello),
    /// Typed user input
    Text {
        #[serde(alias = "data")]
        text: String,
        #[serde(default)]
        device_id: Option<String>,
    },
    /// Microphone state change
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<String>,
    },
    /// Stop the response currently playing
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Keepalive
    Ping,
}

impl ClientMessage {
    /// Wire name of the message type
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Text { .. } => "text",
            Self::Listen { .. } => "listen",
            Self::Abort { .. } => "abort",
            Self::Ping => "ping",
        }
    }
}

/// `listen` state values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    /// Explicit end of the current utterance
    Stop,
    /// Wake word detected on the device
    Detect,
}

/// Handshake payload
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub audio_params: Option<Value>,
    #[serde(default)]
    pub features: Option<Value>,
}

impl Hello {
    /// Look up a header by case-insensitive name
    ///
    /// Numeric header values are returned in their decimal form.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// Device id from headers or the message body
    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        self.header("device-id")
            .or_else(|| self.device_id.clone())
            .filter(|id| !id.trim().is_empty())
    }
}

/// Message sent to a device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted
    Welcome {
        message: String,
        device_id: String,
        session_id: String,
        transport: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_params: Option<Value>,
    },
    /// Assistant reply text
    Text { text: String, device_id: String },
    /// Binary audio frames follow
    Audio {
        format: &'static str,
        device_id: String,
    },
    /// Something went wrong
    Error { kind: String, message: String },
    /// Keepalive reply
    Pong,
}

impl ServerMessage {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Error frame describing a gateway error
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        Self::error(error.kind(), error.to_string())
    }

    /// Serialize to the JSON text sent on the wire
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Binary framing negotiated in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// Raw payload
    #[default]
    V1,
    /// 14-byte header: version, type, reserved (u16), timestamp, size (u32)
    V2,
    /// 4-byte header: type, reserved (u8), size (u16)
    V3,
}

const V2_HEADER: usize = 14;
const V3_HEADER: usize = 4;
const AUDIO_PACKET_TYPE: u8 = 1;

impl ProtocolVersion {
    /// Parse the `protocol-version` header, defaulting to v1
    ///
    /// # Errors
    ///
    /// Returns error for versions other than 1, 2 or 3
    pub fn from_header(value: Option<&str>) -> Result<Self> {
        match value.map(str::trim) {
            None | Some("" | "1") => Ok(Self::V1),
            Some("2") => Ok(Self::V2),
            Some("3") => Ok(Self::V3),
            Some(other) => Err(Error::Protocol(format!(
                "unsupported protocol version: {other}"
            ))),
        }
    }

    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    /// Strip the framing header from an inbound binary unit
    ///
    /// # Errors
    ///
    /// Returns error if the header is truncated or declares more payload
    /// than the unit carries
    pub fn unwrap_audio(self, unit: &[u8]) -> Result<&[u8]> {
        let (header, declared) = match self {
            Self::V1 => return Ok(unit),
            Self::V2 => {
                if unit.len() < V2_HEADER {
                    return Err(Error::Protocol(format!(
                        "v2 audio frame shorter than header: {} bytes",
                        unit.len()
                    )));
                }
                let size = u32::from_be_bytes([unit[10], unit[11], unit[12], unit[13]]);
                (V2_HEADER, size as usize)
            }
            Self::V3 => {
                if unit.len() < V3_HEADER {
                    return Err(Error::Protocol(format!(
                        "v3 audio frame shorter than header: {} bytes",
                        unit.len()
                    )));
                }
                let size = u16::from_be_bytes([unit[2], unit[3]]);
                (V3_HEADER, usize::from(size))
            }
        };

        let body = &unit[header..];
        if declared > body.len() {
            return Err(Error::Protocol(format!(
                "audio frame declares {declared} bytes but carries {}",
                body.len()
            )));
        }
        Ok(&body[..declared])
    }

    /// Prefix an outbound audio chunk with this version's header
    ///
    /// # Errors
    ///
    /// Returns error if the payload does not fit the header's size field
    pub fn wrap_audio(self, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::V1 => Ok(payload.to_vec()),
            Self::V2 => {
                let size = u32::try_from(payload.len())
                    .map_err(|_| Error::ResourceExhausted("audio chunk too large".to_string()))?;
                let mut out = Vec::with_capacity(V2_HEADER + payload.len());
                out.extend_from_slice(&2u16.to_be_bytes());
                out.extend_from_slice(&u16::from(AUDIO_PACKET_TYPE).to_be_bytes());
                out.extend_from_slice(&0u16.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&size.to_be_bytes());
                out.extend_from_slice(payload);
                Ok(out)
            }
            Self::V3 => {
                let size = u16::try_from(payload.len())
                    .map_err(|_| Error::ResourceExhausted("audio chunk too large".to_string()))?;
                let mut out = Vec::with_capacity(V3_HEADER + payload.len());
                out.push(AUDIO_PACKET_TYPE);
                out.push(0);
                out.extend_from_slice(&size.to_be_bytes());
                out.extend_from_slice(payload);
                Ok(out)
            }
        }
    }
}

/// A classified inbound unit, immutable once enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub payload: FramePayload,
    pub arrived_at: Instant,
}

/// Frame contents
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Control(ClientMessage),
    /// PCM16 audio with any framing header removed
    Audio(Vec<u8>),
}

impl Frame {
    #[must_use]
    pub fn new(payload: FramePayload) -> Self {
        Self {
            payload,
            arrived_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_accepts_data_alias() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"text","data":"こんにちは"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Text {
                text: "こんにちは".to_string(),
                device_id: None
            }
        );
    }

    #[test]
    fn test_hello_headers_case_insensitive() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"hello","headers":{"Authorization":"Bearer t","Protocol-Version":3,"device-id":"esp-1"}}"#,
        )
        .unwrap();
        let ClientMessage::Hello(hello) = msg else {
            panic!("expected hello");
        };
        assert_eq!(hello.header("authorization").as_deref(), Some("Bearer t"));
        assert_eq!(hello.header("protocol-version").as_deref(), Some("3"));
        assert_eq!(hello.device_id().as_deref(), Some("esp-1"));
    }

    #[test]
    fn test_welcome_serialization() {
        let json = ServerMessage::Welcome {
            message: "hi".to_string(),
            device_id: "esp-1".to_string(),
            session_id: "abc".to_string(),
            transport: "websocket",
            audio_params: None,
        }
        .to_json()
        .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["device_id"], "esp-1");
        assert!(value.get("audio_params").is_none());
    }

    #[test]
    fn test_v2_header_layout() {
        let wrapped = ProtocolVersion::V2.wrap_audio(&[9, 9, 9]).unwrap();
        assert_eq!(&wrapped[..14], &[0, 2, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(ProtocolVersion::V2.unwrap_audio(&wrapped).unwrap(), &[9, 9, 9]);
    }

    #[test]
    fn test_v3_header_layout() {
        let wrapped = ProtocolVersion::V3.wrap_audio(&[7; 300]).unwrap();
        assert_eq!(&wrapped[..4], &[1, 0, 0x01, 0x2c]);
        assert_eq!(ProtocolVersion::V3.unwrap_audio(&wrapped).unwrap().len(), 300);
    }

    #[test]
    fn test_truncated_frames_rejected() {
        assert!(ProtocolVersion::V2.unwrap_audio(&[0; 10]).is_err());
        assert!(ProtocolVersion::V3.unwrap_audio(&[1, 0, 0, 20, 1, 2]).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        assert_eq!(ProtocolVersion::from_header(None).unwrap(), ProtocolVersion::V1);
        assert!(ProtocolVersion::from_header(Some("9")).is_err());
    }
}
