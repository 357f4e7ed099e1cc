use std::sync::Arc;

use anyhow::{Context, Result};
use beacon_common::types::{Notification, NotificationDraft, UserId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;

/// Durable notification history, backed by PostgreSQL or by process memory
/// when no database is configured.
#[derive(Clone)]
pub enum NotificationStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryNotificationStore>>),
}

#[derive(Default)]
pub struct MemoryNotificationStore {
    next_id: i64,
    rows: Vec<Notification>,
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: i64,
    user_id: i64,
    kind: String,
    message: String,
    is_read: bool,
    created_at: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(value: NotificationRow) -> Self {
        Self {
            id: value.id,
            user_id: value.user_id,
            kind: value.kind,
            message: value.message,
            is_read: value.is_read,
            created_at: value.created_at,
        }
    }
}

impl NotificationStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryNotificationStore::default())))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn insert(
        &self,
        draft: NotificationDraft,
        created_at: DateTime<Utc>,
    ) -> Result<Notification> {
        match self {
            Self::Postgres(pool) => insert_pg(pool, draft, created_at).await,
            Self::Memory(store) => {
                let mut store = store.write().await;
                store.next_id += 1;
                let notification = draft.into_notification(store.next_id, created_at);
                store.rows.push(notification.clone());
                Ok(notification)
            }
        }
    }

    /// Newest first.
    pub async fn list_for_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>> {
        match self {
            Self::Postgres(pool) => list_for_user_pg(pool, user_id, limit, offset).await,
            Self::Memory(store) => {
                let store = store.read().await;
                let mut rows = store
                    .rows
                    .iter()
                    .filter(|row| row.user_id == user_id)
                    .cloned()
                    .collect::<Vec<_>>();
                rows.sort_by(|left, right| {
                    right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
                });

                let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
                let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
                Ok(rows.into_iter().skip(offset).take(limit).collect())
            }
        }
    }

    /// Marks only rows owned by `user_id`; returns how many changed state.
    pub async fn mark_read(&self, user_id: UserId, ids: &[i64]) -> Result<u64> {
        match self {
            Self::Postgres(pool) => mark_read_pg(pool, user_id, ids).await,
            Self::Memory(store) => {
                let mut store = store.write().await;
                let mut updated = 0;
                for row in store.rows.iter_mut() {
                    if row.user_id == user_id && !row.is_read && ids.contains(&row.id) {
                        row.is_read = true;
                        updated += 1;
                    }
                }
                Ok(updated)
            }
        }
    }

    pub async fn count_unread(&self, user_id: UserId) -> Result<i64> {
        match self {
            Self::Postgres(pool) => count_unread_pg(pool, user_id).await,
            Self::Memory(store) => {
                let store = store.read().await;
                let count =
                    store.rows.iter().filter(|row| row.user_id == user_id && !row.is_read).count();
                i64::try_from(count).context("unread count overflow")
            }
        }
    }
}

async fn insert_pg(
    pool: &PgPool,
    draft: NotificationDraft,
    created_at: DateTime<Utc>,
) -> Result<Notification> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO notification (user_id, type, message, is_read, created_at)
        VALUES ($1, $2, $3, FALSE, $4)
        RETURNING id
        "#,
    )
    .bind(draft.user_id)
    .bind(&draft.kind)
    .bind(&draft.message)
    .bind(created_at)
    .fetch_one(pool)
    .await
    .context("failed to insert notification")?;

    Ok(draft.into_notification(id, created_at))
}

async fn list_for_user_pg(
    pool: &PgPool,
    user_id: UserId,
    limit: i64,
    offset: i64,
) -> Result<Vec<Notification>> {
    let rows = sqlx::query_as::<_, NotificationRow>(
        r#"
        SELECT id, user_id, type AS kind, message, is_read, created_at
        FROM notification
        WHERE user_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list notifications")?;

    Ok(rows.into_iter().map(Notification::from).collect())
}

async fn mark_read_pg(pool: &PgPool, user_id: UserId, ids: &[i64]) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE notification
        SET is_read = TRUE
        WHERE user_id = $1
          AND id = ANY($2)
          AND is_read = FALSE
        "#,
    )
    .bind(user_id)
    .bind(ids)
    .execute(pool)
    .await
    .context("failed to mark notifications as read")?;

    Ok(result.rows_affected())
}

async fn count_unread_pg(pool: &PgPool, user_id: UserId) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(id) FROM notification WHERE user_id = $1 AND is_read = FALSE",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("failed to count unread notifications")
}
