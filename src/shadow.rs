//! Shadow document translation layer. Pure encode/decode between sensor
//! payloads and the wire-level shadow envelope, no state between calls.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Attribute name carried for information only, never actuated
pub const TIMESTAMP_ATTRIBUTE: &str = "timestamp";

/// Errors raised while decoding an inbound notification payload.
///
/// These are recoverable: the specific notification is discarded and the
/// caller treats it as "nothing to actuate".
#[derive(Debug, Error)]
pub enum MalformedPayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document has no state.desired field")]
    MissingDesired,
}

/// Wire-level envelope exchanged with the device-twin service.
///
/// Outbound documents carry only `reported`; inbound notifications carry
/// `desired`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShadowDocument {
    pub state: ShadowState,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ShadowState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<Map<String, Value>>,
}

/// Wraps a mapping of attribute names to values under `state.reported`
pub fn encode_reported(reading: Map<String, Value>) -> ShadowDocument {
    ShadowDocument {
        state: ShadowState {
            reported: Some(reading),
            desired: None,
        },
    }
}

/// Builds the reported-state confirmation for an actuation outcome,
/// carrying the attribute, the value that was applied and a timestamp
pub fn encode_confirmation(
    attribute: &str,
    value: &str,
    timestamp: impl Into<String>,
) -> ShadowDocument {
    let mut reported = Map::new();
    reported.insert(attribute.to_string(), Value::String(value.to_string()));
    reported.insert(
        TIMESTAMP_ATTRIBUTE.to_string(),
        Value::String(timestamp.into()),
    );
    encode_reported(reported)
}

/// Parses an inbound notification payload and extracts the desired-state
/// mapping, failing if the payload is not valid JSON or lacks
/// `state.desired`
pub fn decode_desired(payload: &[u8]) -> Result<Map<String, Value>, MalformedPayloadError> {
    let document: ShadowDocument = serde_json::from_slice(payload)?;
    document
        .state
        .desired
        .ok_or(MalformedPayloadError::MissingDesired)
}
