use std::ops::Add;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::{SessionUser, UserSession};
use crate::Error;

pub const SESSION_COOKIE: &str = "sid";
const PURGE_INTERVAL: StdDuration = StdDuration::from_secs(15 * 60);

pub fn new_session_id() -> String {
    let ssid_bytes: [u8; 32] = thread_rng().gen();

    let mut hasher: Sha256 = Digest::new();
    hasher.update(&ssid_bytes);
    hex::encode(hasher.finalize())
}

pub async fn create_session(
    pg: &PgPool,
    user: &SessionUser,
    days: i64,
) -> Result<(String, DateTime<Utc>), Error> {
    let ssid = new_session_id();
    let expires_at = Utc::now().add(Duration::days(days));

    let res = sqlx::query(
        "INSERT INTO sessions (ssid, owner, user_data, expires_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(&ssid)
    .bind(user.owner())
    .bind(Json(user))
    .bind(&expires_at)
    .execute(pg)
    .await?;

    if res.rows_affected() < 1 {
        return Err(Error::InternalError {
            kind: "DatabaseError",
            message: "Could not store session!".to_string(),
        });
    }
    Ok((ssid, expires_at))
}

/// Resolves a session id, dropping the row when it has expired.
pub async fn load_session(pg: &PgPool, ssid: &str) -> Result<Option<SessionUser>, Error> {
    if ssid.is_empty() {
        return Ok(None);
    }
    let session =
        sqlx::query_as::<_, UserSession>("SELECT * FROM sessions WHERE ssid = $1 LIMIT 1")
            .bind(ssid)
            .fetch_optional(pg)
            .await?;

    match session {
        Some(session) if Utc::now().gt(&session.expires_at) => {
            destroy_session(pg, ssid).await?;
            Ok(None)
        }
        Some(session) => Ok(Some(session.user_data.0)),
        None => Ok(None),
    }
}

pub async fn destroy_session(pg: &PgPool, ssid: &str) -> Result<bool, Error> {
    let affected = sqlx::query("DELETE FROM sessions WHERE ssid = $1")
        .bind(ssid)
        .execute(pg)
        .await?;
    Ok(affected.rows_affected() >= 1)
}

pub async fn destroy_sessions_of(pg: &PgPool, owner: &str) -> Result<u64, Error> {
    let affected = sqlx::query("DELETE FROM sessions WHERE owner = $1")
        .bind(owner)
        .execute(pg)
        .await?;
    Ok(affected.rows_affected())
}

pub async fn purge_expired(pg: &PgPool) -> Result<u64, Error> {
    let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
        .execute(pg)
        .await?;
    let resets = sqlx::query("DELETE FROM password_resets WHERE expires_at < NOW()")
        .execute(pg)
        .await?;
    Ok(sessions.rows_affected() + resets.rows_affected())
}

pub fn spawn_purge_task(pg: PgPool) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match purge_expired(&pg).await {
                Ok(0) => {}
                Ok(purged) => log::info!("Purged {} expired session/reset rows", purged),
                Err(err) => log::warn!("Session purge failed: {:?}", err),
            }
        }
    });
}

pub fn session_cookie(ssid: &str, days: i64, secure: bool) -> String {
    let max_age = Duration::days(days).num_seconds();
    format!(
        "{}={}; Path=/; HttpOnly; Max-Age={}; {}",
        SESSION_COOKIE,
        ssid,
        max_age,
        same_site(secure)
    )
}

pub fn clear_cookie(secure: bool) -> String {
    format!(
        "{}=; Path=/; HttpOnly; Max-Age=0; {}",
        SESSION_COOKIE,
        same_site(secure)
    )
}

fn same_site(secure: bool) -> &'static str {
    if secure {
        "SameSite=None; Secure"
    } else {
        "SameSite=Lax"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_hex_sha256() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn cookie_carries_expiry_and_flags() {
        let cookie = session_cookie("abc", 7, false);
        assert!(cookie.starts_with("sid=abc;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Max-Age=604800"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(!cookie.contains("Secure"));

        let secure = session_cookie("abc", 1, true);
        assert!(secure.contains("SameSite=None; Secure"));
    }

    #[test]
    fn clearing_cookie_zeroes_max_age() {
        assert!(clear_cookie(false).starts_with("sid=;"));
        assert!(clear_cookie(false).contains("Max-Age=0"));
    }
}
