use axum::Extension;
use chrono::{DateTime, Duration, Utc};
use rand::{thread_rng, Rng};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::auth::{hash_password, verify_password, CurrentUser};
use crate::extract::Json;
use crate::mailer::{password_otp, Mailer};
use crate::models::{PasswordReset, SessionUser};
use crate::sessions::destroy_sessions_of;
use crate::{breaks, notice, Error, Notice, Payload};

pub const OTP_VALID_MINUTES: i64 = 5;
pub const MAX_OTP_ATTEMPTS: i32 = 5;

pub fn generate_otp() -> String {
    thread_rng().gen_range(100_000..1_000_000).to_string()
}

pub fn otp_digest(otp: &str) -> String {
    let mut hasher: Sha256 = Digest::new();
    hasher.update(otp.trim().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpCheck {
    Valid,
    Expired,
    Invalid { exhausted: bool },
}

pub fn check_otp(reset: &PasswordReset, otp: &str, now: DateTime<Utc>) -> OtpCheck {
    if now > reset.expires_at {
        return OtpCheck::Expired;
    }
    if otp_digest(otp) == reset.otp_hash {
        OtpCheck::Valid
    } else {
        OtpCheck::Invalid {
            exhausted: reset.attempts + 1 >= MAX_OTP_ATTEMPTS,
        }
    }
}

pub async fn change_password(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<ChangePassword>,
) -> Payload<Notice> {
    if body.old_password.is_empty() || body.new_password.is_empty() {
        return breaks(Error::invalid("Old and new passwords are required"));
    }
    let (table, key, id) = match &current.user {
        SessionUser::Student { usn, .. } => ("students", "usn", usn.as_str()),
        SessionUser::Faculty { ssn_id, .. } => ("faculty", "ssn_id", ssn_id.as_str()),
        SessionUser::Admin { username } => ("admins", "username", username.as_str()),
    };

    let stored = sqlx::query_as::<_, (String,)>(&format!(
        "SELECT password_hash FROM {} WHERE {} = $1",
        table, key
    ))
    .bind(id)
    .fetch_optional(&pg)
    .await?;
    let (stored_hash,) = match stored {
        Some(row) => row,
        None => {
            return breaks(Error::UserDoesNotExist {
                message: "User not found".to_string(),
            })
        }
    };
    if !verify_password(&body.old_password, &stored_hash)? {
        return breaks(Error::invalid("Old password is incorrect"));
    }

    sqlx::query(&format!(
        "UPDATE {} SET password_hash = $1 WHERE {} = $2",
        table, key
    ))
    .bind(hash_password(&body.new_password)?)
    .bind(id)
    .execute(&pg)
    .await?;
    log::info!("Password changed for {}", current.user.owner());
    notice("Password updated successfully")
}

pub async fn forgot_password(
    Extension(pg): Extension<PgPool>,
    Extension(mailer): Extension<Mailer>,
    Json(body): Json<ForgotPassword>,
) -> Payload<Notice> {
    let email = body.email.trim().to_lowercase();
    if email.is_empty() {
        return breaks(Error::invalid("Email is required"));
    }

    single_account(accounts_with_email(&pg, &email).await?)?;

    let otp = generate_otp();
    sqlx::query(
        "INSERT INTO password_resets (email, otp_hash, attempts, expires_at)
         VALUES ($1, $2, 0, $3)
         ON CONFLICT (email) DO UPDATE SET
           otp_hash = EXCLUDED.otp_hash,
           attempts = 0,
           expires_at = EXCLUDED.expires_at",
    )
    .bind(&email)
    .bind(otp_digest(&otp))
    .bind(Utc::now() + Duration::minutes(OTP_VALID_MINUTES))
    .execute(&pg)
    .await?;

    if let Err(err) = mailer.send(&password_otp(&email, &otp, OTP_VALID_MINUTES)).await {
        log::error!("OTP mail to {} failed: {:#}", email, err);
        return breaks(Error::InternalError {
            kind: "MailError",
            message: "Failed to send OTP".to_string(),
        });
    }
    notice("OTP sent to email")
}

pub async fn reset_password(
    Extension(pg): Extension<PgPool>,
    Json(body): Json<ResetPassword>,
) -> Payload<Notice> {
    let email = body.email.trim().to_lowercase();
    if email.is_empty() || body.otp.trim().is_empty() || body.new_password.is_empty() {
        return breaks(Error::invalid("Email, OTP and new password are required"));
    }

    let reset = sqlx::query_as::<_, PasswordReset>(
        "SELECT email, otp_hash, attempts, expires_at FROM password_resets WHERE email = $1",
    )
    .bind(&email)
    .fetch_optional(&pg)
    .await?;
    let reset = match reset {
        Some(reset) => reset,
        None => return breaks(Error::invalid("OTP not requested")),
    };

    match check_otp(&reset, &body.otp, Utc::now()) {
        OtpCheck::Valid => {}
        OtpCheck::Expired => {
            forget_otp(&pg, &email).await?;
            return breaks(Error::invalid("OTP expired"));
        }
        OtpCheck::Invalid { exhausted: true } => {
            log::warn!("Too many OTP attempts for {}, reset cancelled", email);
            forget_otp(&pg, &email).await?;
            return breaks(Error::invalid("Invalid OTP"));
        }
        OtpCheck::Invalid { exhausted: false } => {
            sqlx::query("UPDATE password_resets SET attempts = attempts + 1 WHERE email = $1")
                .bind(&email)
                .execute(&pg)
                .await?;
            return breaks(Error::invalid("Invalid OTP"));
        }
    }

    if let Err(err) = single_account(accounts_with_email(&pg, &email).await?) {
        forget_otp(&pg, &email).await?;
        return breaks(err);
    }

    let hash = hash_password(&body.new_password)?;
    let student = sqlx::query_as::<_, (String,)>(
        "UPDATE students SET password_hash = $1 WHERE LOWER(email) = $2 RETURNING usn",
    )
    .bind(&hash)
    .bind(&email)
    .fetch_optional(&pg)
    .await?;
    let owner = match student {
        Some((usn,)) => format!("student:{}", usn.trim()),
        None => {
            let faculty = sqlx::query_as::<_, (String,)>(
                "UPDATE faculty SET password_hash = $1 WHERE LOWER(email) = $2 RETURNING ssn_id",
            )
            .bind(&hash)
            .bind(&email)
            .fetch_optional(&pg)
            .await?;
            match faculty {
                Some((ssn_id,)) => format!("faculty:{}", ssn_id.trim()),
                None => {
                    forget_otp(&pg, &email).await?;
                    return breaks(Error::UserDoesNotExist {
                        message: "Email not registered".to_string(),
                    });
                }
            }
        }
    };

    forget_otp(&pg, &email).await?;
    let dropped = destroy_sessions_of(&pg, &owner).await?;
    log::info!("Password reset for {} ({} sessions closed)", owner, dropped);
    notice("Password reset successful")
}

/// Resets are keyed by email, so they need exactly one matching account.
pub fn single_account(count: i64) -> Result<(), Error> {
    match count {
        0 => Err(Error::UserDoesNotExist {
            message: "Email not registered".to_string(),
        }),
        1 => Ok(()),
        _ => Err(Error::invalid(
            "Email is shared by multiple accounts, contact the administrator",
        )),
    }
}

async fn accounts_with_email(pg: &PgPool, email: &str) -> Result<i64, Error> {
    let (count,) = sqlx::query_as::<_, (i64,)>(
        "SELECT (SELECT COUNT(*) FROM students WHERE LOWER(email) = $1)
              + (SELECT COUNT(*) FROM faculty WHERE LOWER(email) = $1)",
    )
    .bind(email)
    .fetch_one(pg)
    .await?;
    Ok(count)
}

async fn forget_otp(pg: &PgPool, email: &str) -> Result<(), Error> {
    sqlx::query("DELETE FROM password_resets WHERE email = $1")
        .bind(email)
        .execute(pg)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePassword {
    #[serde(default)]
    old_password: String,
    #[serde(default)]
    new_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForgotPassword {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPassword {
    #[serde(default)]
    email: String,
    #[serde(default)]
    otp: String,
    #[serde(default)]
    new_password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(otp: &str, attempts: i32, expires_in: Duration) -> PasswordReset {
        PasswordReset {
            email: "asha@college.edu".to_string(),
            otp_hash: otp_digest(otp),
            attempts,
            expires_at: Utc::now() + expires_in,
        }
    }

    #[test]
    fn otps_are_six_digits() {
        for _ in 0..100 {
            let otp = generate_otp();
            assert_eq!(otp.len(), 6);
            assert!(otp.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn only_the_digest_is_compared() {
        let reset = pending("123456", 0, Duration::minutes(5));
        assert_ne!(reset.otp_hash, "123456");
        assert_eq!(check_otp(&reset, " 123456 ", Utc::now()), OtpCheck::Valid);
        assert_eq!(
            check_otp(&reset, "654321", Utc::now()),
            OtpCheck::Invalid { exhausted: false }
        );
    }

    #[test]
    fn expired_otp_is_rejected_even_when_correct() {
        let reset = pending("123456", 0, Duration::minutes(-1));
        assert_eq!(check_otp(&reset, "123456", Utc::now()), OtpCheck::Expired);
    }

    #[test]
    fn resets_need_exactly_one_account() {
        assert!(matches!(
            single_account(0),
            Err(Error::UserDoesNotExist { .. })
        ));
        assert!(single_account(1).is_ok());
        let shared = single_account(2).unwrap_err();
        assert_eq!(shared.status(), axum::http::StatusCode::BAD_REQUEST);
        assert!(matches!(shared, Error::InvalidPayload { .. }));
    }

    #[test]
    fn fifth_wrong_attempt_exhausts_the_otp() {
        let reset = pending("123456", MAX_OTP_ATTEMPTS - 1, Duration::minutes(5));
        assert_eq!(
            check_otp(&reset, "000000", Utc::now()),
            OtpCheck::Invalid { exhausted: true }
        );
    }
}
