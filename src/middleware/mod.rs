use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{header, request::Parts},
};
use base64::{engine::general_purpose, Engine as _};
use std::sync::Arc;

use crate::error::AppError;
use crate::models::User;
use crate::AppState;

const MAX_GUEST_TOKEN_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

// Basic Auth extractor
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or(AppError::Unauthorized)?;
        authenticate(header_value, state).await
    }
}

// Optional variant: no Authorization header means an anonymous (guest) caller,
// a present but invalid header is still rejected.
impl OptionalFromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Option<Self>, Self::Rejection> {
        match parts.headers.get(header::AUTHORIZATION) {
            Some(header_value) => authenticate(header_value, state).await.map(Some),
            None => Ok(None),
        }
    }
}

async fn authenticate(
    header_value: &axum::http::HeaderValue,
    state: &Arc<AppState>,
) -> Result<AuthUser, AppError> {
    let (email, password) = parse_basic_credentials(header_value.to_str().map_err(|_| AppError::Unauthorized)?)
        .ok_or(AppError::Unauthorized)?;

    let user = User::find_by_email(&state.db.pool, &email)
        .await?
        .filter(|u| u.is_active)
        .ok_or(AppError::Unauthorized)?;

    // bcrypt is CPU bound, keep it off the async workers
    let verified = tokio::task::spawn_blocking({
        let user = user.clone();
        move || user.verify_password(&password)
    })
    .await
    .map_err(|e| AppError::Internal(anyhow::anyhow!("password check panicked: {e}")))?;

    if !verified {
        return Err(AppError::Unauthorized);
    }

    Ok(AuthUser {
        user_id: user.id,
        email: user.email,
        first_name: user.first_name,
        last_name: user.last_name,
    })
}

fn parse_basic_credentials(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (email, password) = credentials.split_once(':')?;
    Some((email.to_string(), password.to_string()))
}

/// Identity a seat hold is attributed to.
///
/// Authenticated callers always lock as themselves; anonymous callers must
/// bring a guest token. The prefixes keep the two namespaces apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockerId(String);

impl LockerId {
    pub fn resolve(user: Option<&AuthUser>, guest_token: Option<&str>) -> Result<Self, AppError> {
        if let Some(user) = user {
            return Ok(LockerId(format!("user:{}", user.user_id)));
        }

        let token = guest_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AppError::LockerIdRequired)?;

        if token.len() > MAX_GUEST_TOKEN_LEN
            || !token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AppError::Validation(format!(
                "locker_id must be 1-{MAX_GUEST_TOKEN_LEN} characters of [A-Za-z0-9_-]"
            )));
        }

        Ok(LockerId(format!("guest:{token}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_user(id: i64) -> AuthUser {
        AuthUser {
            user_id: id,
            email: "fan@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Fan".to_string(),
        }
    }

    #[test]
    fn authenticated_identity_wins_over_guest_token() {
        let user = auth_user(42);
        let locker = LockerId::resolve(Some(&user), Some("abc")).unwrap();
        assert_eq!(locker.as_str(), "user:42");
    }

    #[test]
    fn guest_token_is_namespaced() {
        let locker = LockerId::resolve(None, Some(" tab-7_x ")).unwrap();
        assert_eq!(locker.as_str(), "guest:tab-7_x");
    }

    #[test]
    fn absent_identity_is_rejected() {
        assert!(matches!(LockerId::resolve(None, None), Err(AppError::LockerIdRequired)));
        assert!(matches!(LockerId::resolve(None, Some("   ")), Err(AppError::LockerIdRequired)));
    }

    #[test]
    fn guest_token_cannot_spoof_a_user_prefix() {
        assert!(matches!(
            LockerId::resolve(None, Some("user:42")),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn basic_credentials_are_decoded() {
        let header = format!("Basic {}", general_purpose::STANDARD.encode("fan@example.com:pa:ss"));
        assert_eq!(
            parse_basic_credentials(&header),
            Some(("fan@example.com".to_string(), "pa:ss".to_string()))
        );
        assert_eq!(parse_basic_credentials("Bearer abc"), None);
    }
}
