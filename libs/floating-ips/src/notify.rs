//! lifecycle notifications
use std::{fmt, net::IpAddr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::context::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "network.floating_ip.allocate")]
    Allocate,
    #[serde(rename = "network.floating_ip.deallocate")]
    Deallocate,
    #[serde(rename = "network.floating_ip.associate")]
    Associate,
    #[serde(rename = "network.floating_ip.disassociate")]
    Disassociate,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Allocate => "network.floating_ip.allocate",
            EventType::Deallocate => "network.floating_ip.deallocate",
            EventType::Associate => "network.floating_ip.associate",
            EventType::Disassociate => "network.floating_ip.disassociate",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Info,
    Warn,
    Error,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Info => "info",
            Priority::Warn => "warn",
            Priority::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub project_id: Option<String>,
    pub floating_ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instance_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: EventType,
    /// `network.<host>`
    pub publisher_id: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub payload: Payload,
}

impl Notification {
    pub fn info(
        ctx: &RequestContext,
        host: &str,
        event_type: EventType,
        payload: Payload,
    ) -> Self {
        Self {
            event_type,
            publisher_id: format!("network.{host}"),
            priority: Priority::Info,
            timestamp: Utc::now(),
            request_id: ctx.request_id,
            payload,
        }
    }
}

/// Publishes notifications. Delivery failures are the notifier's to log, the
/// operation that emitted the event does not fail.
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug + 'static {
    async fn notify(&self, notification: Notification);
}

/// writes each notification as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: Notification) {
        info!(
            event_type = %n.event_type,
            publisher_id = %n.publisher_id,
            priority = n.priority.as_str(),
            request_id = %n.request_id,
            project_id = ?n.payload.project_id,
            floating_ip = %n.payload.floating_ip,
            instance_id = ?n.payload.instance_id,
            "notification"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tracing_test::traced_test;

    use super::*;

    fn sample() -> Notification {
        Notification::info(
            &RequestContext::for_project("p1"),
            "net-1",
            EventType::Associate,
            Payload {
                project_id: Some("p1".into()),
                floating_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)),
                instance_id: None,
            },
        )
    }

    #[test]
    fn event_type_wire_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["event_type"], "network.floating_ip.associate");
        assert_eq!(json["publisher_id"], "network.net-1");
        assert_eq!(json["priority"], "info");
        assert!(json["payload"].get("instance_id").is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn log_notifier_writes_event() {
        LogNotifier.notify(sample()).await;
        assert!(logs_contain("network.floating_ip.associate"));
        assert!(logs_contain("203.0.113.1"));
    }
}
