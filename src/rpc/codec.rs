//! Line-delimited JSON framing for plugin calls
//!
//! Every frame is one JSON object terminated by `\n`. Calls carry a numeric
//! id that the reply echoes, so replies may arrive in any order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodec;

use super::TransportError;
use crate::plugin::schema::{WireRequest, WireResponse};

/// Method name of the single operation a plugin exposes
pub const SERVE_HTTP: &str = "Middleware.ServeHTTP";

/// Upper bound for one frame; request bodies travel inside frames
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    pub id: u64,
    pub method: String,
    pub params: WireRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WireResponse>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcReply {
    pub fn ok(id: u64, result: WireResponse) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<WireResponse, TransportError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(TransportError::Remote(error)),
            (Some(result), None) => Ok(result),
            (None, None) => Err(TransportError::Decode(format!(
                "reply {} has neither result nor error",
                self.id
            ))),
        }
    }
}

pub fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)
}

/// Encode one frame. Frames the peer's codec would reject are refused here,
/// so an oversized call fails alone instead of breaking the connection.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, TransportError> {
    let line = serde_json::to_string(frame).map_err(|e| TransportError::Encode(e.to_string()))?;
    if line.len() > MAX_FRAME_LENGTH {
        return Err(TransportError::Encode(format!(
            "frame of {} bytes exceeds the {} byte limit",
            line.len(),
            MAX_FRAME_LENGTH
        )));
    }
    Ok(line)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, TransportError> {
    serde_json::from_str(line.trim()).map_err(|e| TransportError::Decode(e.to_string()))
}
