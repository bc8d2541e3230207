//! # Codec
//!
//! Serialization capability used by the pipeline, decoupled from a specific format.
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ClassifiedError, ErrorCode};

/// Encode values to text and decode them back.
/// Every failure is a fatal `SERIALIZATION_ERROR`: a payload that does not decode now never will.
pub trait Codec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, ClassifiedError>;

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, ClassifiedError>;
}

/// `Codec` implementation backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, ClassifiedError> {
        serde_json::to_string(value).map_err(|error| {
            ClassifiedError::fatal(ErrorCode::SerializationError, "failed to serialize object")
                .with_cause(error)
        })
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, ClassifiedError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(ClassifiedError::fatal(
                ErrorCode::SerializationError,
                "received empty payload",
            ));
        }

        serde_json::from_slice(payload).map_err(|error| {
            ClassifiedError::fatal(
                ErrorCode::SerializationError,
                format!("failed to deserialize JSON: {error}"),
            )
            .with_context("target_type", std::any::type_name::<T>())
            .with_payload_snippet(payload)
            .with_cause(error)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: Option<String>,
    }

    #[test]
    fn test_decode_valid_payload() {
        let ping: Ping = JsonCodec.decode(br#"{"seq": 7, "note": null}"#).unwrap();

        assert_eq!(ping, Ping { seq: 7, note: None });
    }

    #[test]
    fn test_decode_empty_payload_is_fatal() {
        for payload in [&b""[..], &b"  \n"[..]] {
            let error = JsonCodec.decode::<Ping>(payload).unwrap_err();

            assert_eq!(error.code(), ErrorCode::SerializationError);
            assert!(!error.is_retryable());
        }
    }

    #[test]
    fn test_decode_truncated_payload_is_fatal_with_snippet() {
        let payload = br#"{"seq": 7, "no"#;

        let error = JsonCodec.decode::<Ping>(payload).unwrap_err();

        assert_eq!(error.code(), ErrorCode::SerializationError);
        assert_eq!(error.context()["payload_snippet"], r#"{"seq": 7, "no"#);
    }

    #[test]
    fn test_decode_invalid_utf8_is_fatal() {
        let error = JsonCodec.decode::<Ping>(&[0xff, 0xfe, 0x7b]).unwrap_err();

        assert_eq!(error.code(), ErrorCode::SerializationError);
    }

    #[test]
    fn test_encode() {
        let encoded = JsonCodec
            .encode(&Ping {
                seq: 1,
                note: Some("hi".to_owned()),
            })
            .unwrap();

        assert_eq!(encoded, r#"{"seq":1,"note":"hi"}"#);
    }
}
