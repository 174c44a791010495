//! Frame codec for inbound telemetry messages
//!
//! Pure decoding of raw transport text into typed [`InboundMessage`]
//! values. Malformed input is rejected with a [`DecodeError`]; the
//! caller decides whether to skip or escalate (a single bad frame must
//! never terminate the channel).

#![warn(missing_docs)]

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    AssetState, EventPayload, FrameKind, FramePayload, PositionPayload, StatusPayload,
    TelemetryFrame, VitalsPayload,
};

/// Errors that can occur while decoding an inbound message
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Input is not structurally valid JSON or misses required fields
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `kind` tag is not one of the known frame kinds
    #[error("Unknown frame kind: {0}")]
    UnknownKind(String),

    /// A field parsed but holds an out-of-range value
    #[error("Invalid field {field}: {reason}")]
    InvalidField {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// One incremental telemetry frame
    Frame(TelemetryFrame),
    /// Full-state replacement issued after a connectivity gap
    Resync(Vec<AssetState>),
}

/// Raw frame envelope before kind-driven payload validation
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "assetId")]
    asset_id: String,
    sequence: i64,
    ts: i64,
    kind: String,
    payload: Value,
}

/// Resync envelope: `{type:"resync", assets:[...]}`
#[derive(Debug, Deserialize)]
struct RawResync {
    assets: Vec<AssetState>,
}

/// Decode one raw transport message into a typed [`InboundMessage`]
///
/// Pure function, no side effects. Distinguishes the `resync` envelope
/// from incremental frames by the top-level `type` tag.
pub fn decode(raw: &str) -> Result<InboundMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;

    if value.get("type").and_then(Value::as_str) == Some("resync") {
        let resync: RawResync = serde_json::from_value(value)?;
        return Ok(InboundMessage::Resync(resync.assets));
    }

    let raw_frame: RawFrame = serde_json::from_value(value)?;
    Ok(InboundMessage::Frame(validate_frame(raw_frame)?))
}

fn validate_frame(raw: RawFrame) -> Result<TelemetryFrame, DecodeError> {
    if raw.asset_id.is_empty() {
        return Err(DecodeError::InvalidField {
            field: "assetId",
            reason: "empty asset identifier".to_string(),
        });
    }

    // Zero doubles as the "nothing applied yet" floor downstream, so
    // sequences start at one.
    if raw.sequence <= 0 {
        return Err(DecodeError::InvalidField {
            field: "sequence",
            reason: format!("non-positive sequence {}", raw.sequence),
        });
    }

    if raw.ts <= 0 {
        return Err(DecodeError::InvalidField {
            field: "ts",
            reason: format!("non-positive timestamp {}", raw.ts),
        });
    }

    let kind = match raw.kind.as_str() {
        "position" => FrameKind::Position,
        "vitals" => FrameKind::Vitals,
        "status" => FrameKind::Status,
        "event" => FrameKind::Event,
        other => return Err(DecodeError::UnknownKind(other.to_string())),
    };

    // Payload shape is dictated by the kind tag, never guessed.
    let payload = match kind {
        FrameKind::Position => {
            FramePayload::Position(serde_json::from_value::<PositionPayload>(raw.payload)?)
        }
        FrameKind::Vitals => {
            FramePayload::Vitals(serde_json::from_value::<VitalsPayload>(raw.payload)?)
        }
        FrameKind::Status => {
            FramePayload::Status(serde_json::from_value::<StatusPayload>(raw.payload)?)
        }
        FrameKind::Event => {
            FramePayload::Event(serde_json::from_value::<EventPayload>(raw.payload)?)
        }
    };

    Ok(TelemetryFrame {
        asset_id: raw.asset_id,
        sequence: raw.sequence as u64,
        timestamp: raw.ts as u64,
        kind,
        payload,
    })
}
