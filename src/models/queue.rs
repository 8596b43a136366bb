use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ReservationExpiryEntry {
    pub id: i64,
    pub booking_id: i64,
    pub expires_at: DateTime<Utc>,
    pub processed: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct TicketGenerationRow {
    pub id: i64,
    pub booking_id: i64,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub version: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketGenerationEntry {
    pub id: i64,
    pub booking_id: i64,
    pub status: QueueStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    /// Claim marker; bumped by every claim so a superseded worker cannot
    /// complete or fail the entry.
    pub version: i64,
    pub error: Option<String>,
}

impl TryFrom<TicketGenerationRow> for TicketGenerationEntry {
    type Error = String;

    fn try_from(row: TicketGenerationRow) -> Result<Self, Self::Error> {
        let status = QueueStatus::parse(&row.status)
            .ok_or_else(|| format!("queue entry {} has unknown status {}", row.id, row.status))?;
        Ok(TicketGenerationEntry {
            id: row.id,
            booking_id: row.booking_id,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            next_attempt_at: row.next_attempt_at,
            version: row.version,
            error: row.error,
        })
    }
}
