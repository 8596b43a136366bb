use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::database::Tx;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub is_guest: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    // Найти пользователя по email
    pub async fn find_by_email<'e, E>(executor: E, email: &str) -> Result<Option<User>, sqlx::Error>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, first_name, last_name, is_guest, is_active, created_at
             FROM users WHERE email = $1",
        )
        .bind(normalize_email(email))
        .fetch_optional(executor)
        .await
    }

    /// Inserts a guest account, or returns the existing account when another
    /// request registered the same email first.
    pub async fn insert_guest(
        tx: &mut Tx<'_>,
        email: &str,
        first_name: &str,
        last_name: &str,
        password_hash: &str,
    ) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, password_hash, first_name, last_name, is_guest)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
            RETURNING id, email, password_hash, first_name, last_name, is_guest, is_active, created_at
            "#,
        )
        .bind(normalize_email(email))
        .bind(password_hash)
        .bind(first_name)
        .bind(last_name)
        .fetch_one(&mut **tx)
        .await
    }

    pub fn verify_password(&self, password: &str) -> bool {
        // Guest placeholder hashes are never handed out, so guests cannot log in.
        !self.is_guest && bcrypt::verify(password, &self.password_hash).unwrap_or(false)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
