//! Topic addressing on message buses
//!
//! | Purpose | Topic |
//! |---|---|
//! | Request | `foris-controller/{controller_id}/request/{module}/action/{action}` |
//! | Reply | `foris-controller/{controller_id}/reply/{request_id}` |
//! | Liveness | `foris-controller/{controller_id}/notification/remote/action/advertize` |
//! | Notification | `foris-controller/{controller_id}/notification/{module}/action/{action}` |
//!
//! Filters use MQTT wildcards: `+` matches one level, `#` the remainder.

use crate::error::ProtocolError;

/// First level of every foris-controller topic
pub const TOPIC_PREFIX: &str = "foris-controller";

const ADVERTISEMENT_MODULE: &str = "remote";
const ADVERTISEMENT_ACTION: &str = "advertize";

/// Topic a request for `module`/`action` is published on
pub fn request(controller_id: &str, module: &str, action: &str) -> String {
    format!("{TOPIC_PREFIX}/{controller_id}/request/{module}/action/{action}")
}

/// Filter matching every request addressed to a controller
pub fn request_filter(controller_id: &str) -> String {
    format!("{TOPIC_PREFIX}/{controller_id}/request/+/action/+")
}

/// Topic the reply to `request_id` arrives on
pub fn reply(controller_id: &str, request_id: &str) -> String {
    format!("{TOPIC_PREFIX}/{controller_id}/reply/{request_id}")
}

/// Filter matching every reply from a controller
pub fn reply_filter(controller_id: &str) -> String {
    format!("{TOPIC_PREFIX}/{controller_id}/reply/+")
}

/// Topic of the controller's liveness broadcast
pub fn advertisement(controller_id: &str) -> String {
    notification(controller_id, ADVERTISEMENT_MODULE, ADVERTISEMENT_ACTION)
}

/// Topic of a generic notification
pub fn notification(controller_id: &str, module: &str, action: &str) -> String {
    format!("{TOPIC_PREFIX}/{controller_id}/notification/{module}/action/{action}")
}

/// Filter for notifications, `None` meaning any controller or module
pub fn notification_filter(controller_id: Option<&str>, module: Option<&str>) -> String {
    format!(
        "{TOPIC_PREFIX}/{}/notification/{}/action/+",
        controller_id.unwrap_or("+"),
        module.unwrap_or("+"),
    )
}

/// A topic seen on the inbound side, decomposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    Request {
        controller_id: String,
        module: String,
        action: String,
    },
    Reply {
        controller_id: String,
        request_id: String,
    },
    Advertisement {
        controller_id: String,
    },
    Notification {
        controller_id: String,
        module: String,
        action: String,
    },
}

impl InboundTopic {
    /// Decompose a concrete (wildcard free) topic
    pub fn parse(topic: &str) -> Result<Self, ProtocolError> {
        let levels: Vec<&str> = topic.split('/').collect();
        if levels.iter().any(|level| level.is_empty()) {
            return Err(ProtocolError::MalformedTopic(topic.to_string()));
        }

        match levels.as_slice() {
            [TOPIC_PREFIX, controller_id, "reply", request_id] => Ok(Self::Reply {
                controller_id: controller_id.to_string(),
                request_id: request_id.to_string(),
            }),
            [TOPIC_PREFIX, controller_id, "notification", ADVERTISEMENT_MODULE, "action", ADVERTISEMENT_ACTION] => {
                Ok(Self::Advertisement {
                    controller_id: controller_id.to_string(),
                })
            }
            [TOPIC_PREFIX, controller_id, "notification", module, "action", action] => {
                Ok(Self::Notification {
                    controller_id: controller_id.to_string(),
                    module: module.to_string(),
                    action: action.to_string(),
                })
            }
            [TOPIC_PREFIX, controller_id, "request", module, "action", action] => Ok(Self::Request {
                controller_id: controller_id.to_string(),
                module: module.to_string(),
                action: action.to_string(),
            }),
            _ => Err(ProtocolError::MalformedTopic(topic.to_string())),
        }
    }
}

/// Check whether `topic` matches the MQTT-style `filter`
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builders() {
        assert_eq!(
            request("0000AABBCCDDEEFF", "about", "get"),
            "foris-controller/0000AABBCCDDEEFF/request/about/action/get"
        );
        assert_eq!(
            reply("C1", "r1"),
            "foris-controller/C1/reply/r1"
        );
        assert_eq!(
            advertisement("C1"),
            "foris-controller/C1/notification/remote/action/advertize"
        );
        assert_eq!(
            notification_filter(None, Some("web")),
            "foris-controller/+/notification/web/action/+"
        );
    }

    #[test]
    fn test_parse_reply() {
        let parsed = InboundTopic::parse("foris-controller/C1/reply/abc-def").unwrap();
        assert_eq!(
            parsed,
            InboundTopic::Reply {
                controller_id: "C1".to_string(),
                request_id: "abc-def".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_advertisement_before_notification() {
        let parsed = InboundTopic::parse(&advertisement("C1")).unwrap();
        assert_eq!(
            parsed,
            InboundTopic::Advertisement {
                controller_id: "C1".to_string()
            }
        );

        let parsed = InboundTopic::parse(&notification("C1", "remote", "other")).unwrap();
        assert!(matches!(parsed, InboundTopic::Notification { .. }));
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        for topic in [
            "other/C1/reply/r1",
            "foris-controller/C1/reply",
            "foris-controller/C1/reply/r1/extra",
            "foris-controller//reply/r1",
            "foris-controller/C1/unknown/a/action/b",
        ] {
            assert!(
                matches!(
                    InboundTopic::parse(topic),
                    Err(ProtocolError::MalformedTopic(_))
                ),
                "{topic} should be rejected"
            );
        }
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches(&reply_filter("C1"), &reply("C1", "r1")));
        assert!(!matches(&reply_filter("C1"), &reply("C2", "r1")));
        assert!(!matches(&reply_filter("C1"), "foris-controller/C1/reply"));
        assert!(matches("foris-controller/#", &advertisement("C9")));
        assert!(matches(
            &notification_filter(None, None),
            &notification("C1", "web", "set_language")
        ));
        assert!(!matches(
            &notification_filter(Some("C1"), Some("web")),
            &notification("C1", "maintain", "reboot")
        ));
        assert!(matches(&request_filter("C1"), &request("C1", "echo", "echo")));
    }
}
