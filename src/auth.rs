use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequest, RequestParts};
use axum::headers::Cookie;
use axum::http::header::SET_COOKIE;
use axum::{Extension, TypedHeader};
use chrono::{DateTime, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::config::Config;
use crate::extract::Json;
use crate::models::{
    AdminData, FacultyData, SessionUser, StudentData, FACULTY_COLUMNS, STUDENT_COLUMNS,
};
use crate::sessions::{
    clear_cookie, create_session, destroy_session, load_session, session_cookie, SESSION_COOKIE,
};
use crate::{breaks, proceeds, CookiePayload, Error, Payload};

pub fn hash_password(password: &str) -> Result<String, Error> {
    Ok(Pbkdf2
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))?
        .to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool, Error> {
    let hash = PasswordHash::new(stored_hash)?;
    Ok(Pbkdf2.verify_password(password.as_bytes(), &hash).is_ok())
}

/// The authenticated caller, resolved from the `sid` cookie.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub ssid: String,
    pub user: SessionUser,
}

#[async_trait]
impl<B> FromRequest<B> for CurrentUser
where
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let Extension(pg) = Extension::<PgPool>::from_request(req)
            .await
            .map_err(|_| Error::InternalError {
                kind: "StateError",
                message: "Database pool missing from request".to_string(),
            })?;
        let cookies = Option::<TypedHeader<Cookie>>::from_request(req)
            .await
            .unwrap_or(None);
        let ssid = cookies
            .as_ref()
            .and_then(|TypedHeader(cookie)| cookie.get(SESSION_COOKIE))
            .map(str::to_string)
            .ok_or_else(Error::unauthorized)?;

        let user = load_session(&pg, &ssid)
            .await?
            .ok_or_else(Error::unauthorized)?;
        Ok(CurrentUser { ssid, user })
    }
}

impl CurrentUser {
    pub fn student_usn(&self) -> Result<&str, Error> {
        match &self.user {
            SessionUser::Student { usn, .. } => Ok(usn),
            _ => Err(Error::forbidden("Student access only")),
        }
    }

    /// Faculty or admin; returns the name recorded as author of their writes.
    pub fn require_staff(&self) -> Result<String, Error> {
        match &self.user {
            SessionUser::Faculty { name, .. } => Ok(name.clone()),
            SessionUser::Admin { username } => Ok(username.clone()),
            SessionUser::Student { .. } => Err(Error::forbidden("Faculty access only")),
        }
    }

    pub fn require_admin(&self) -> Result<(), Error> {
        match &self.user {
            SessionUser::Admin { .. } => Ok(()),
            _ => Err(Error::forbidden("Admin access only")),
        }
    }

    /// Students always resolve to themselves; staff must name a student.
    pub fn resolve_usn(&self, requested: Option<&str>) -> Result<String, Error> {
        match (&self.user, requested.map(str::trim)) {
            (SessionUser::Student { usn, .. }, _) => Ok(usn.clone()),
            (_, Some(usn)) if !usn.is_empty() => Ok(usn.to_string()),
            _ => Err(Error::invalid("`usn` parameter is required")),
        }
    }
}

/// Ids are trimmed on write, so lookups compare the key column directly.
fn lookup_by_key(columns: &str, table: &str, key: &str) -> String {
    format!("SELECT {} FROM {} WHERE {} = $1 LIMIT 1", columns, table, key)
}

pub async fn fetch_student(pg: &PgPool, usn: &str) -> Result<Option<StudentData>, Error> {
    let student = sqlx::query_as::<_, StudentData>(&lookup_by_key(
        STUDENT_COLUMNS,
        "students",
        "usn",
    ))
    .bind(usn.trim())
    .fetch_optional(pg)
    .await?;
    Ok(student)
}

pub async fn fetch_faculty(pg: &PgPool, ssn_id: &str) -> Result<Option<FacultyData>, Error> {
    let faculty = sqlx::query_as::<_, FacultyData>(&lookup_by_key(
        FACULTY_COLUMNS,
        "faculty",
        "ssn_id",
    ))
    .bind(ssn_id.trim())
    .fetch_optional(pg)
    .await?;
    Ok(faculty)
}

pub async fn login_student(
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Json(login): Json<LoginStudent>,
) -> CookiePayload<LoggedIn> {
    check_password_present(&login.password)?;

    let student = fetch_student(&pg, &login.usn)
        .await?
        .ok_or_else(|| Error::UserDoesNotExist {
            message: "Student not found".to_string(),
        })?;
    check_password(&login.password, &student.password_hash)?;

    let user = SessionUser::Student {
        usn: student.usn.trim().to_string(),
        sem: student.semester,
        section: student.section,
    };
    start_session(&pg, &config, user, "/student-home").await
}

pub async fn login_faculty(
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Json(login): Json<LoginFaculty>,
) -> CookiePayload<LoggedIn> {
    check_password_present(&login.password)?;

    let faculty = fetch_faculty(&pg, &login.ssn_id)
        .await?
        .ok_or_else(|| Error::UserDoesNotExist {
            message: "Faculty not found".to_string(),
        })?;
    check_password(&login.password, &faculty.password_hash)?;

    let user = SessionUser::Faculty {
        ssn_id: faculty.ssn_id.trim().to_string(),
        name: faculty.name,
    };
    start_session(&pg, &config, user, "/faculty-home").await
}

pub async fn login_admin(
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Json(login): Json<LoginAdmin>,
) -> CookiePayload<LoggedIn> {
    check_password_present(&login.password)?;

    let admin = sqlx::query_as::<_, AdminData>(
        "SELECT username, password_hash FROM admins WHERE username = $1 LIMIT 1",
    )
    .bind(login.username.trim())
    .fetch_optional(&pg)
    .await?
    .ok_or_else(|| Error::UserDoesNotExist {
        message: "Admin not found".to_string(),
    })?;
    check_password(&login.password, &admin.password_hash)?;

    let user = SessionUser::Admin {
        username: admin.username,
    };
    start_session(&pg, &config, user, "/admin-home").await
}

fn check_password_present(password: &str) -> Result<(), Error> {
    if password.is_empty() {
        return Err(Error::MissingCredentials {
            message: "`password` parameter was empty".to_string(),
        });
    }
    Ok(())
}

fn check_password(password: &str, stored_hash: &str) -> Result<(), Error> {
    if !verify_password(password, stored_hash)? {
        return Err(Error::AuthenticationFailure {
            message: "Invalid password".to_string(),
        });
    }
    Ok(())
}

async fn start_session(
    pg: &PgPool,
    config: &Config,
    user: SessionUser,
    redirect: &'static str,
) -> CookiePayload<LoggedIn> {
    let (ssid, expires_at) = create_session(pg, &user, config.session_days).await?;
    log::info!("Session opened for {}", user.owner());

    let cookie = session_cookie(&ssid, config.session_days, config.cookie_secure);
    Ok((
        [(SET_COOKIE, cookie)],
        crate::err::Fine(LoggedIn {
            redirect,
            expires_at,
            user,
        }),
    ))
}

pub async fn logout(
    current: Option<CurrentUser>,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
) -> CookiePayload<LoggedOut> {
    if let Some(current) = current {
        destroy_session(&pg, &current.ssid).await?;
    }
    Ok((
        [(SET_COOKIE, clear_cookie(config.cookie_secure))],
        crate::err::Fine(LoggedOut {
            message: "Logged out",
        }),
    ))
}

pub async fn session_status(current: Option<CurrentUser>) -> Payload<SessionStatus> {
    proceeds(SessionStatus {
        logged_in: current.is_some(),
        user: current.map(|current| current.user),
    })
}

pub async fn current_student(current: CurrentUser) -> Payload<CurrentStudent> {
    match current.user {
        SessionUser::Student { usn, sem, section } => {
            proceeds(CurrentStudent { usn, sem, section })
        }
        _ => breaks(Error::unauthorized()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedIn {
    redirect: &'static str,
    expires_at: DateTime<Utc>,
    user: SessionUser,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedOut {
    message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    logged_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<SessionUser>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentStudent {
    usn: String,
    sem: i32,
    section: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginStudent {
    usn: String,
    password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginFaculty {
    ssn_id: String,
    password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginAdmin {
    username: String,
    password: String,
}
