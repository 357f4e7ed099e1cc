// Core domain types shared across all Beacon crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a user as carried in access tokens and notification rows.
///
/// Zero and negative values never name a user.
pub type UserId = i64;

/// A persisted notification, exactly as it is pushed to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: i64,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a notification before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationDraft {
    pub user_id: UserId,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DraftError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("invalid user id {0}")]
    InvalidUser(UserId),
}

impl NotificationDraft {
    pub fn new(user_id: UserId, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { user_id, kind: kind.into(), message: message.into() }
    }

    pub fn validate(&self) -> Result<(), DraftError> {
        if self.message.trim().is_empty() {
            return Err(DraftError::EmptyMessage);
        }
        if !is_valid_user_id(self.user_id) {
            return Err(DraftError::InvalidUser(self.user_id));
        }
        Ok(())
    }

    /// Materialize the draft as a fresh, unread notification.
    pub fn into_notification(self, id: i64, created_at: DateTime<Utc>) -> Notification {
        Notification {
            id,
            user_id: self.user_id,
            kind: self.kind,
            message: self.message,
            is_read: false,
            created_at,
        }
    }
}

pub const fn is_valid_user_id(user_id: UserId) -> bool {
    user_id > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_requires_non_blank_message() {
        let draft = NotificationDraft::new(7, "task_assigned", "   ");
        assert_eq!(draft.validate(), Err(DraftError::EmptyMessage));
    }

    #[test]
    fn draft_requires_positive_user() {
        assert_eq!(
            NotificationDraft::new(0, "task_assigned", "hi").validate(),
            Err(DraftError::InvalidUser(0))
        );
        assert_eq!(
            NotificationDraft::new(-3, "task_assigned", "hi").validate(),
            Err(DraftError::InvalidUser(-3))
        );
    }

    #[test]
    fn draft_becomes_unread_notification() {
        let created_at = Utc::now();
        let notification =
            NotificationDraft::new(42, "comment_added", "new comment").into_notification(5, created_at);

        assert_eq!(notification.id, 5);
        assert_eq!(notification.user_id, 42);
        assert_eq!(notification.kind, "comment_added");
        assert!(!notification.is_read);
        assert_eq!(notification.created_at, created_at);
    }
}
