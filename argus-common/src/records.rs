//! Backend wire records observed by the proxy

use serde::de::{self, DeserializeOwned, Unexpected};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Model name used when a request does not carry one
pub const UNKNOWN_MODEL: &str = "unknown";

const NANOS_PER_SECOND: f64 = 1e9;

/// Metadata read from a `/api/chat` or `/api/generate` request body.
///
/// Only the fields the proxy needs are decoded; everything else in the body
/// is ignored here and forwarded untouched from the original bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Requested model
    #[serde(default)]
    pub model: String,

    /// Whether the client asked for a line-streamed response
    #[serde(default)]
    pub stream: bool,
}

impl RequestEnvelope {
    /// Parse the envelope from a raw request body
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        decode_object(body)
    }

    /// Model identifier for metric keys, `"unknown"` when absent
    pub fn model_id(&self) -> &str {
        if self.model.is_empty() {
            UNKNOWN_MODEL
        } else {
            &self.model
        }
    }
}

/// A response object, either a whole non-streamed reply or one line of a
/// streamed reply. Timing and token fields are only meaningful once `done`
/// is true.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub created_at: String,

    #[serde(default)]
    pub done: bool,

    /// Nanoseconds
    #[serde(default)]
    pub total_duration: u64,

    /// Nanoseconds spent loading the model, zero when already resident
    #[serde(default)]
    pub load_duration: u64,

    #[serde(default)]
    pub prompt_eval_count: u64,

    /// Nanoseconds
    #[serde(default)]
    pub prompt_eval_duration: u64,

    /// Generated tokens
    #[serde(default)]
    pub eval_count: u64,

    /// Nanoseconds
    #[serde(default)]
    pub eval_duration: u64,
}

impl ModelResponse {
    /// Parse a single record from raw bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        decode_object(bytes)
    }

    pub fn load_duration_secs(&self) -> f64 {
        self.load_duration as f64 / NANOS_PER_SECOND
    }

    pub fn total_duration_secs(&self) -> f64 {
        self.total_duration as f64 / NANOS_PER_SECOND
    }
}

/// Decode `bytes` as `T`, accepting only a top-level JSON object.
///
/// Derived struct impls would otherwise fill fields from an array in order.
fn decode_object<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    let value: Value = serde_json::from_slice(bytes)?;
    if value.is_object() {
        return serde_json::from_value(value);
    }
    let unexpected = match &value {
        Value::Object(_) | Value::Null => Unexpected::Unit,
        Value::Bool(b) => Unexpected::Bool(*b),
        Value::Number(_) => Unexpected::Other("number"),
        Value::String(s) => Unexpected::Str(s),
        Value::Array(_) => Unexpected::Seq,
    };
    Err(de::Error::invalid_type(unexpected, &"a JSON object"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_reads_model_and_stream() {
        let body = br#"{"model":"llama3","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
        let envelope = RequestEnvelope::parse(body).unwrap();
        assert_eq!(envelope.model_id(), "llama3");
        assert!(envelope.stream);
    }

    #[test]
    fn test_envelope_defaults() {
        let envelope = RequestEnvelope::parse(br#"{"prompt":"hello"}"#).unwrap();
        assert_eq!(envelope.model_id(), UNKNOWN_MODEL);
        assert!(!envelope.stream);

        let envelope = RequestEnvelope::parse(br#"{"model":""}"#).unwrap();
        assert_eq!(envelope.model_id(), UNKNOWN_MODEL);
    }

    #[test]
    fn test_envelope_rejects_malformed_body() {
        assert!(RequestEnvelope::parse(b"not json").is_err());
        assert!(RequestEnvelope::parse(b"").is_err());
        assert!(RequestEnvelope::parse(br#"["llama3"]"#).is_err());
        assert!(RequestEnvelope::parse(br#"{"model":"x","stream":"yes"}"#).is_err());
    }

    #[test]
    fn test_envelope_rejects_non_object_json() {
        assert!(RequestEnvelope::parse(br#"["llama3", true]"#).is_err());
        assert!(RequestEnvelope::parse(b"42").is_err());
        assert!(RequestEnvelope::parse(br#""llama3""#).is_err());
        assert!(RequestEnvelope::parse(b"null").is_err());
    }

    #[test]
    fn test_response_rejects_array() {
        let line = br#"["llama3", "2024-05-01T10:00:00Z", true]"#;
        assert!(ModelResponse::parse(line).is_err());
    }

    #[test]
    fn test_response_terminal_fields() {
        let line = br#"{"model":"llama3","created_at":"2024-05-01T10:00:00Z","done":true,"total_duration":5000000000,"load_duration":2000000000,"prompt_eval_count":10,"eval_count":42}"#;
        let record = ModelResponse::parse(line).unwrap();
        assert!(record.done);
        assert_eq!(record.eval_count, 42);
        assert_eq!(record.prompt_eval_count, 10);
        assert_eq!(record.load_duration_secs(), 2.0);
        assert_eq!(record.total_duration_secs(), 5.0);
    }

    #[test]
    fn test_response_intermediate_chunk() {
        let line = br#"{"model":"llama3","message":{"role":"assistant","content":"Hel"},"done":false}"#;
        let record = ModelResponse::parse(line).unwrap();
        assert!(!record.done);
        assert_eq!(record.eval_count, 0);
        assert_eq!(record.load_duration, 0);
    }
}
