use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub starts_at: DateTime<Utc>,
}

impl Event {
    pub async fn find<'e, E>(executor: E, event_id: i64) -> Result<Option<Event>, sqlx::Error>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query_as::<_, Event>("SELECT id, title, starts_at FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(executor)
            .await
    }
}
