//! Lifecycle notifications published on NATS.
use async_trait::async_trait;
use floating_ips::{Notification, Notifier};
use tracing::{trace, warn};

use crate::{client::NatsClient, metrics::NOTIFY_PUBLISH_ERRORS, models::encode};

/// Publishes JSON to `<prefix>.notifications.<priority>`. Failures are
/// logged, the operation that emitted the event has already happened.
#[derive(Debug, Clone)]
pub struct NatsNotifier {
    client: NatsClient,
}

impl NatsNotifier {
    pub fn new(client: NatsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for NatsNotifier {
    async fn notify(&self, notification: Notification) {
        let subject = self.client.resolver().notification_subject(notification.priority);
        let sent = match encode(&notification) {
            Ok(payload) => self.client.publish(&subject, payload).await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(()) => trace!(subject, event_type = %notification.event_type, "notification published"),
            Err(err) => {
                NOTIFY_PUBLISH_ERRORS.inc();
                warn!(
                    %err,
                    subject,
                    event_type = %notification.event_type,
                    floating_ip = %notification.payload.floating_ip,
                    "failed to publish notification"
                );
            }
        }
    }
}
