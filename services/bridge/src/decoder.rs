//! Decoding and validation of image message payloads.
//!
//! Payloads are JSON objects of the form
//!
//! ```json
//! {"image_base64": "aGk=", "width": 10, "height": "20"}
//! ```
//!
//! Width and height are sender-declared and are never checked against the
//! image bytes.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

pub const IMAGE_FIELD: &str = "image_base64";
pub const WIDTH_FIELD: &str = "width";
pub const HEIGHT_FIELD: &str = "height";

/// Reasons a payload is rejected. Each one is local to a single message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    MalformedStructure(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid base64 image data: {0}")]
    BadEncoding(String),

    #[error("Field {0} is not a positive integer")]
    InvalidNumber(&'static str),
}

/// A validated message, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Decoded image bytes
    pub image: Vec<u8>,
    /// Sender-declared width
    pub width: i32,
    /// Sender-declared height
    pub height: i32,
    /// When the bridge received the message
    pub received_at: DateTime<Utc>,
}

/// Parse and validate a raw payload.
pub fn decode(
    payload: &[u8],
    topic: &str,
    received_at: DateTime<Utc>,
) -> Result<ImageMessage, DecodeError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| DecodeError::MalformedStructure(e.to_string()))?;

    let fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Err(DecodeError::MalformedStructure(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let encoded = require(&fields, IMAGE_FIELD)?;
    let width = require(&fields, WIDTH_FIELD)?;
    let height = require(&fields, HEIGHT_FIELD)?;

    let image = match encoded {
        Value::String(s) => STANDARD
            .decode(s)
            .map_err(|e| DecodeError::BadEncoding(e.to_string()))?,
        other => {
            return Err(DecodeError::BadEncoding(format!(
                "expected a string, got {}",
                json_kind(other)
            )))
        }
    };

    Ok(ImageMessage {
        topic: topic.to_string(),
        image,
        width: dimension(width, WIDTH_FIELD)?,
        height: dimension(height, HEIGHT_FIELD)?,
        received_at,
    })
}

fn require<'a>(fields: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, DecodeError> {
    fields.get(name).ok_or(DecodeError::MissingField(name))
}

/// Accepts a JSON integer, a whole-valued float such as `10.0`, or a string
/// holding an integer.
fn dimension(value: &Value, field: &'static str) -> Result<i32, DecodeError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() <= f64::from(i32::MAX))
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    parsed
        .and_then(|n| i32::try_from(n).ok())
        .filter(|n| *n > 0)
        .ok_or(DecodeError::InvalidNumber(field))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_decode_valid_payload() {
        let now = Utc::now();
        let raw = payload(json!({
            "image_base64": STANDARD.encode(b"hi"),
            "width": 10,
            "height": 20
        }));

        let message = decode(&raw, "test/topic/image", now).unwrap();
        assert_eq!(message.image, b"hi");
        assert_eq!(message.width, 10);
        assert_eq!(message.height, 20);
        assert_eq!(message.topic, "test/topic/image");
        assert_eq!(message.received_at, now);
    }

    #[test]
    fn test_image_bytes_round_trip() {
        let original: Vec<u8> = (0..=255).collect();
        let raw = payload(json!({
            "image_base64": STANDARD.encode(&original),
            "width": 16,
            "height": 16
        }));

        let message = decode(&raw, "t", Utc::now()).unwrap();
        assert_eq!(message.image, original);
    }

    #[test]
    fn test_numeric_strings_accepted() {
        let raw = payload(json!({
            "image_base64": "aGk=",
            "width": "640",
            "height": " 480 "
        }));

        let message = decode(&raw, "t", Utc::now()).unwrap();
        assert_eq!((message.width, message.height), (640, 480));
    }

    #[test]
    fn test_missing_fields() {
        let cases = [
            (json!({"width": 1, "height": 1}), IMAGE_FIELD),
            (json!({"image_base64": "aGk=", "height": 1}), WIDTH_FIELD),
            (json!({"image_base64": "aGk=", "width": 1}), HEIGHT_FIELD),
        ];

        for (value, field) in cases {
            assert_eq!(
                decode(&payload(value), "t", Utc::now()),
                Err(DecodeError::MissingField(field))
            );
        }
    }

    #[test]
    fn test_bad_encoding() {
        let raw = payload(json!({
            "image_base64": "not base64!!",
            "width": 1,
            "height": 1
        }));
        assert!(matches!(
            decode(&raw, "t", Utc::now()),
            Err(DecodeError::BadEncoding(_))
        ));

        let raw = payload(json!({"image_base64": 42, "width": 1, "height": 1}));
        assert!(matches!(
            decode(&raw, "t", Utc::now()),
            Err(DecodeError::BadEncoding(_))
        ));
    }

    #[test]
    fn test_whole_float_dimensions() {
        let raw = payload(json!({"image_base64": "aGk=", "width": 10.0, "height": 20}));
        let message = decode(&raw, "t", Utc::now()).unwrap();
        assert_eq!((message.width, message.height), (10, 20));
    }

    #[test]
    fn test_invalid_numbers() {
        for width in [json!("wide"), json!(1.5), json!(0), json!(-2.0), json!(1e12), json!(-3), json!(null), json!(4_294_967_296_i64)] {
            let raw = payload(json!({"image_base64": "aGk=", "width": width, "height": 1}));
            assert_eq!(
                decode(&raw, "t", Utc::now()),
                Err(DecodeError::InvalidNumber(WIDTH_FIELD))
            );
        }

        let raw = payload(json!({"image_base64": "aGk=", "width": 1, "height": "1e3"}));
        assert_eq!(
            decode(&raw, "t", Utc::now()),
            Err(DecodeError::InvalidNumber(HEIGHT_FIELD))
        );
    }

    #[test]
    fn test_malformed_structure() {
        assert!(matches!(
            decode(b"{not json", "t", Utc::now()),
            Err(DecodeError::MalformedStructure(_))
        ));
        assert!(matches!(
            decode(b"[1, 2, 3]", "t", Utc::now()),
            Err(DecodeError::MalformedStructure(_))
        ));
        assert!(matches!(
            decode(&[0xff, 0xfe, 0x00], "t", Utc::now()),
            Err(DecodeError::MalformedStructure(_))
        ));
    }
}
