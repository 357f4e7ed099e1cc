use std::sync::Arc;

use beacon_common::types::{Notification, UserId};
use serde::Serialize;
use tracing::debug;

use crate::{
    metrics,
    realtime::{registry::ConnectionRegistry, session::EnqueueError},
};

/// Outcome of a unicast delivery attempt. Never an error for the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    Offline,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastSummary {
    pub queued: usize,
    pub dropped: usize,
}

/// Producer entry point. Every call returns without waiting on a socket.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn send(&self, user_id: UserId, notification: Notification) -> Delivery {
        let Some(session) = self.registry.lookup(user_id) else {
            metrics::increment_notifications_offline();
            return Delivery::Offline;
        };

        let notification_id = notification.id;
        match session.try_enqueue(notification) {
            Ok(()) => {
                metrics::increment_notifications_queued();
                Delivery::Queued
            }
            Err(error) => {
                metrics::increment_notifications_dropped();
                debug!(
                    user_id,
                    session_id = %session.id(),
                    notification_id,
                    reason = %error,
                    "dropped notification for realtime session"
                );
                Delivery::Dropped
            }
        }
    }

    pub fn broadcast(&self, notification: &Notification) -> BroadcastSummary {
        let mut summary = BroadcastSummary::default();

        for session in self.registry.sessions() {
            match session.try_enqueue(notification.clone()) {
                Ok(()) => {
                    metrics::increment_notifications_queued();
                    summary.queued += 1;
                }
                Err(EnqueueError::Full | EnqueueError::Closed) => {
                    metrics::increment_notifications_dropped();
                    summary.dropped += 1;
                }
            }
        }

        debug!(
            notification_id = notification.id,
            queued = summary.queued,
            dropped = summary.dropped,
            "broadcast notification"
        );
        summary
    }

    pub fn connected_users(&self) -> Vec<UserId> {
        self.registry.connected_users()
    }
}
