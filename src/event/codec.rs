//! Payload encoding.
//!
//! Outgoing payloads use the configured [`Serializer`]; incoming payloads
//! are decoded by the content type stamped on the message, so services
//! configured differently can still talk to each other.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Serializer;
use crate::error::CodecError;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const BITCODE_CONTENT_TYPE: &str = "application/x-bitcode";

impl Serializer {
    pub fn content_type(&self) -> &'static str {
        match self {
            Serializer::Json => JSON_CONTENT_TYPE,
            Serializer::Bitcode => BITCODE_CONTENT_TYPE,
        }
    }

    /// Serializer for a message content type. Parameters such as
    /// `; charset=utf-8` are ignored.
    pub fn for_content_type(content_type: &str) -> Result<Self, CodecError> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            JSON_CONTENT_TYPE | "text/json" => Ok(Serializer::Json),
            BITCODE_CONTENT_TYPE => Ok(Serializer::Bitcode),
            _ => Err(CodecError::UnsupportedContentType(content_type.to_string())),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Serializer::Json => Ok(serde_json::to_vec(value)?),
            Serializer::Bitcode => Ok(bitcode::serialize(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Serializer::Json => Ok(serde_json::from_slice(bytes)?),
            Serializer::Bitcode => Ok(bitcode::deserialize(bytes)?),
        }
    }
}

/// Decode `bytes` according to `content_type`.
pub fn decode_payload<T: DeserializeOwned>(
    content_type: &str,
    bytes: &[u8],
) -> Result<T, CodecError> {
    Serializer::for_content_type(content_type)?.decode(bytes)
}
