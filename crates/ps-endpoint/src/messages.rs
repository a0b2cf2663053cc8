//! Request/response envelope for endpoint-to-endpoint operations.
//!
//! These travel as JSON text payloads over peer connections. Requests and
//! responses share one schema discriminated by `kind`; a response echoes the
//! request's `uuid`, which the originator uses to resolve the pending
//! future. Binary values ride in `data` as base64.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
}

/// Endpoint key/value operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointOp {
    Evict,
    Exists,
    Get,
    Set,
}

/// One endpoint-to-endpoint message, request or response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRequest {
    pub kind: MessageKind,
    pub op: EndpointOp,
    /// Correlation id; responses echo the request's value.
    pub uuid: Uuid,
    pub key: String,
    /// Object bytes for `set` requests and `get` responses.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EndpointRequest {
    /// Build a fresh request with a new correlation id.
    pub fn request(op: EndpointOp, key: &str, data: Option<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Request,
            op,
            uuid: Uuid::new_v4(),
            key: key.to_owned(),
            data,
            exists: None,
            success: None,
            error: None,
        }
    }

    /// Empty response scaffold correlated to this request.
    pub fn response(&self) -> Self {
        Self {
            kind: MessageKind::Response,
            op: self.op,
            uuid: self.uuid,
            key: self.key.clone(),
            data: None,
            exists: None,
            success: None,
            error: None,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => STANDARD
                .decode(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_response_share_the_correlation_id() {
        let request = EndpointRequest::request(EndpointOp::Get, "key", None);
        let response = request.response();
        assert_eq!(response.uuid, request.uuid);
        assert_eq!(response.kind, MessageKind::Response);
        assert_eq!(response.op, EndpointOp::Get);
        assert_eq!(response.key, "key");
    }

    #[test]
    fn data_round_trips_as_base64() {
        let request = EndpointRequest::request(EndpointOp::Set, "key", Some(vec![0, 1, 2, 255]));
        let text = serde_json::to_string(&request).expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["kind"], "request");
        assert_eq!(value["op"], "set");
        assert!(value["data"].is_string());

        let decoded: EndpointRequest = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(decoded, request);
    }

    #[test]
    fn absent_optional_fields_are_omitted() {
        let request = EndpointRequest::request(EndpointOp::Exists, "key", None);
        let text = serde_json::to_string(&request).expect("serialize");
        assert!(!text.contains("\"data\""));
        assert!(!text.contains("\"success\""));
        assert!(!text.contains("\"error\""));
    }
}
