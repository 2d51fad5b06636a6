//! Frame demultiplexer: classifies raw transport units into frames

use serde_json::Value;

use crate::protocol::{ClientMessage, Frame, FramePayload, ProtocolVersion};
use crate::transport::InboundUnit;
use crate::{Error, Result};

/// Parse a JSON control message
///
/// # Errors
///
/// Returns a protocol error if the text is not a JSON object with a string
/// `type`, names an unknown type, or is missing required fields
pub fn parse_control(text: &str) -> Result<ClientMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("invalid JSON: {e}")))?;

    let Some(object) = value.as_object() else {
        return Err(Error::Protocol("control frame must be a JSON object".to_string()));
    };
    let Some(kind) = object.get("type").and_then(Value::as_str) else {
        return Err(Error::Protocol("control frame has no string \"type\"".to_string()));
    };
    let kind = kind.to_string();

    serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("invalid \"{kind}\" frame: {e}")))
}

/// Classifies inbound units for one session
#[derive(Debug, Clone, Copy)]
pub struct Demux {
    version: ProtocolVersion,
    dtx_threshold: usize,
}

impl Demux {
    #[must_use]
    pub const fn new(version: ProtocolVersion, dtx_threshold: usize) -> Self {
        Self {
            version,
            dtx_threshold,
        }
    }

    /// Classify one unit
    ///
    /// Returns `Ok(None)` for keepalive binary units that carry no audio.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for malformed control or audio frames
    pub fn classify(&self, unit: InboundUnit) -> Result<Option<Frame>> {
        match unit {
            InboundUnit::Text(text) => {
                parse_control(&text).map(|msg| Some(Frame::new(FramePayload::Control(msg))))
            }
            InboundUnit::Binary(data) => {
                if data.len() <= self.dtx_threshold {
                    tracing::trace!(bytes = data.len(), "dropping keepalive packet");
                    return Ok(None);
                }
                let audio = self.version.unwrap_audio(&data)?;
                if audio.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Frame::new(FramePayload::Audio(audio.to_vec()))))
            }
        }
    }
}
