use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced while decoding or interpreting an inbound envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("envelope has no string `method`")]
    MissingMethod,
    #[error("envelope `params` is not a list")]
    InvalidParams,
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("invalid parameter {index} for `{method}`: {reason}")]
    InvalidParam {
        method: String,
        index: usize,
        reason: String,
    },
}

impl EnvelopeError {
    pub fn invalid_param(method: &str, index: usize, reason: impl Into<String>) -> Self {
        EnvelopeError::InvalidParam {
            method: method.to_string(),
            index,
            reason: reason.into(),
        }
    }
}

/// The `{ method, params }` unit exchanged over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub method: String,
    pub params: Vec<Value>,
}

impl Envelope {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Decode a raw frame. A missing or `null` `params` is read as an empty list.
    pub fn decode(frame: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(frame)
            .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        Self::from_value(value)
    }

    pub fn decode_str(frame: &str) -> Result<Self, EnvelopeError> {
        Self::decode(frame.as_bytes())
    }

    /// Validate an already-parsed JSON value as an envelope.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut object) = value else {
            return Err(EnvelopeError::NotAnObject);
        };
        let method = match object.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(EnvelopeError::MissingMethod),
        };
        let params = match object.remove("params") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(params)) => params,
            Some(_) => return Err(EnvelopeError::InvalidParams),
        };
        Ok(Self { method, params })
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::with_capacity(2);
        object.insert("method".into(), Value::String(self.method.clone()));
        object.insert("params".into(), Value::Array(self.params.clone()));
        Value::Object(object)
    }

    /// Compact JSON text of this envelope.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode())
    }

    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_then_decode_preserves_method_and_param_order() {
        let envelope = Envelope::new(
            "message",
            vec![json!("peer-b"), json!({"method": "peer:update"}), json!(3)],
        );
        let decoded = Envelope::decode_str(&envelope.encode()).expect("decode");
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.param(0), Some(&json!("peer-b")));
        assert_eq!(decoded.param(2), Some(&json!(3)));
    }

    #[test]
    fn missing_or_null_params_decode_as_empty() {
        let missing = Envelope::decode_str(r#"{"method":"me"}"#).expect("decode");
        assert!(missing.params.is_empty());
        let null = Envelope::decode_str(r#"{"method":"me","params":null}"#).expect("decode");
        assert!(null.params.is_empty());
    }

    #[test]
    fn unknown_fields_are_dropped_on_reencode() {
        let envelope =
            Envelope::decode_str(r#"{"method":"me","params":[1],"extra":true}"#).expect("decode");
        assert_eq!(envelope.encode(), r#"{"method":"me","params":[1]}"#);
    }

    #[test]
    fn rejects_schema_violations() {
        assert!(matches!(
            Envelope::decode(b"{not json"),
            Err(EnvelopeError::Malformed(_))
        ));
        assert_eq!(
            Envelope::decode_str("[1,2]"),
            Err(EnvelopeError::NotAnObject)
        );
        assert_eq!(
            Envelope::decode_str(r#"{"params":[]}"#),
            Err(EnvelopeError::MissingMethod)
        );
        assert_eq!(
            Envelope::decode_str(r#"{"method":7,"params":[]}"#),
            Err(EnvelopeError::MissingMethod)
        );
        assert_eq!(
            Envelope::decode_str(r#"{"method":"broadcast","params":{"a":1}}"#),
            Err(EnvelopeError::InvalidParams)
        );
    }
}
