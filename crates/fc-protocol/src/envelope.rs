//! Message envelopes exchanged with foris-controller
//!
//! All envelopes are JSON documents. On message buses a request carries the
//! id the controller must reply under; replies carry either a payload or an
//! ordered list of errors. Stream sockets carry `StreamRequest` instead,
//! because the connection itself correlates the reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request published on a bus request topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Request id the controller publishes the reply under
    pub reply_msg_id: String,
    /// Request payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RequestEnvelope {
    pub fn new(reply_msg_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            reply_msg_id: reply_msg_id.into(),
            data,
        }
    }
}

/// One entry of a controller error list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerFault {
    /// Human readable description
    pub description: String,
    /// Controller-side stacktrace, present in debug deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl ControllerFault {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            stacktrace: None,
        }
    }
}

/// Reply to a request
///
/// Fields other than `data` and `errors` (the controller echoes `module`,
/// `action` and `kind`) are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ControllerFault>>,
}

impl ReplyEnvelope {
    /// Successful reply carrying `data`
    pub fn success(data: Option<Value>) -> Self {
        Self { data, errors: None }
    }

    /// Failed reply carrying an error list
    pub fn failure(errors: Vec<ControllerFault>) -> Self {
        Self {
            data: None,
            errors: Some(errors),
        }
    }

    /// Split into the payload or the error list.
    ///
    /// An `errors` key takes precedence over `data`, even when the list is
    /// empty.
    pub fn into_outcome(self) -> Result<Option<Value>, Vec<ControllerFault>> {
        match self.errors {
            Some(errors) => Err(errors),
            None => Ok(self.data),
        }
    }
}

/// Asynchronous notification emitted by a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub module: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Periodic liveness broadcast
///
/// `{"id": "<controller id>", "data": {"state": "...", "working_replies": [...]}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: String,
    pub data: AdvertisementData,
}

/// Body of a liveness broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementData {
    #[serde(default)]
    pub state: String,
    /// Request ids the controller is currently processing
    #[serde(default)]
    pub working_replies: Vec<String>,
}

impl Advertisement {
    pub fn new(id: impl Into<String>, state: impl Into<String>, working: Vec<String>) -> Self {
        Self {
            id: id.into(),
            data: AdvertisementData {
                state: state.into(),
                working_replies: working,
            },
        }
    }
}

/// Request sent over a stream socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub kind: String,
    pub module: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl StreamRequest {
    pub fn new(module: impl Into<String>, action: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            kind: "request".to_string(),
            module: module.into(),
            action: action.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_omits_missing_data() {
        let request = RequestEnvelope::new("abc", None);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, json!({"reply_msg_id": "abc"}));
    }

    #[test]
    fn test_reply_errors_take_precedence() {
        let reply: ReplyEnvelope = serde_json::from_value(json!({
            "module": "about",
            "action": "get",
            "kind": "reply",
            "data": {"ignored": true},
            "errors": [
                {"description": "first", "stacktrace": "trace"},
                {"description": "second"}
            ]
        }))
        .unwrap();

        let errors = reply.into_outcome().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].stacktrace.as_deref(), Some("trace"));
        assert_eq!(errors[1], ControllerFault::new("second"));
    }

    #[test]
    fn test_reply_without_data() {
        let reply: ReplyEnvelope = serde_json::from_str("{}").unwrap();
        assert_eq!(reply.into_outcome().unwrap(), None);
    }

    #[test]
    fn test_advertisement_parsing() {
        let advert: Advertisement = serde_json::from_value(json!({
            "id": "0000AABBCCDDEEFF",
            "data": {"state": "running", "working_replies": ["r1", "r2"]}
        }))
        .unwrap();
        assert_eq!(advert.id, "0000AABBCCDDEEFF");
        assert_eq!(advert.data.working_replies, vec!["r1", "r2"]);
    }

    #[test]
    fn test_advertisement_requires_data() {
        let parsed = serde_json::from_value::<Advertisement>(json!({"id": "x"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_stream_request_kind() {
        let request = StreamRequest::new("about", "get", None);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"kind": "request", "module": "about", "action": "get"})
        );
    }
}
