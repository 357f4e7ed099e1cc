// Notification service: persists first, then hands the stored record to
// the realtime dispatcher.

pub mod store;

use beacon_common::types::{
    is_valid_user_id, DraftError, Notification, NotificationDraft, UserId,
};
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::realtime::{Delivery, Dispatcher};

pub use store::NotificationStore;

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error(transparent)]
    Invalid(#[from] DraftError),
    #[error("no notification ids provided")]
    EmptySelection,
    #[error("notification store failed")]
    Storage(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    /// Missing or non-positive limits fall back to the default page size;
    /// negative offsets start from the beginning.
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        let limit = match limit {
            Some(limit) if limit > 0 => limit.min(MAX_PAGE_SIZE),
            _ => DEFAULT_PAGE_SIZE,
        };
        let offset = offset.filter(|offset| *offset >= 0).unwrap_or(0);
        Self { limit, offset }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Clone)]
pub struct NotificationService {
    store: NotificationStore,
    dispatcher: Dispatcher,
}

impl NotificationService {
    pub fn new(store: NotificationStore, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    /// Validate, persist, then push to the user's live session if any.
    /// Delivery outcome never turns into an error.
    pub async fn create(&self, draft: NotificationDraft) -> Result<Notification, NotificationError> {
        draft.validate()?;

        let notification =
            self.store.insert(draft, Utc::now()).await.map_err(NotificationError::Storage)?;

        let delivery = self.dispatcher.send(notification.user_id, notification.clone());
        debug!(
            notification_id = notification.id,
            user_id = notification.user_id,
            delivered = matches!(delivery, Delivery::Queued),
            ?delivery,
            "notification created"
        );

        Ok(notification)
    }

    pub async fn create_for_user(
        &self,
        user_id: UserId,
        kind: &str,
        message: &str,
    ) -> Result<Notification, NotificationError> {
        self.create(NotificationDraft::new(user_id, kind, message)).await
    }

    /// Stops at the first failure; notifications created before it stay
    /// persisted and dispatched.
    pub async fn create_for_users(
        &self,
        user_ids: &[UserId],
        kind: &str,
        message: &str,
    ) -> Result<Vec<Notification>, NotificationError> {
        let mut created = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            created.push(self.create_for_user(*user_id, kind, message).await?);
        }
        Ok(created)
    }

    pub async fn list(
        &self,
        user_id: UserId,
        page: Page,
    ) -> Result<Vec<Notification>, NotificationError> {
        ensure_user(user_id)?;
        self.store
            .list_for_user(user_id, page.limit, page.offset)
            .await
            .map_err(NotificationError::Storage)
    }

    pub async fn mark_read(&self, user_id: UserId, ids: &[i64]) -> Result<u64, NotificationError> {
        ensure_user(user_id)?;
        if ids.is_empty() {
            return Err(NotificationError::EmptySelection);
        }
        self.store.mark_read(user_id, ids).await.map_err(NotificationError::Storage)
    }

    pub async fn count_unread(&self, user_id: UserId) -> Result<i64, NotificationError> {
        ensure_user(user_id)?;
        self.store.count_unread(user_id).await.map_err(NotificationError::Storage)
    }
}

fn ensure_user(user_id: UserId) -> Result<(), NotificationError> {
    if is_valid_user_id(user_id) {
        Ok(())
    } else {
        Err(DraftError::InvalidUser(user_id).into())
    }
}
