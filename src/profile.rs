use axum::extract::Multipart;
use axum::response::Response;
use axum::Extension;
use serde::Serialize;
use sqlx::PgPool;

use crate::auth::{fetch_faculty, fetch_student, CurrentUser};
use crate::files::{blob_response, read_upload, Disposition};
use crate::models::{FacultyData, SessionUser, StoredFile, StudentData};
use crate::{breaks, notice, proceeds, Error, Notice, Payload};

/// Profile of the logged-in user, tagged with their role.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Profile {
    Student(StudentData),
    Faculty(FacultyData),
    Admin { username: String },
}

pub async fn profile(current: CurrentUser, Extension(pg): Extension<PgPool>) -> Payload<Profile> {
    let profile = match current.user {
        SessionUser::Student { usn, .. } => fetch_student(&pg, &usn).await?.map(Profile::Student),
        SessionUser::Faculty { ssn_id, .. } => {
            fetch_faculty(&pg, &ssn_id).await?.map(Profile::Faculty)
        }
        SessionUser::Admin { username } => Some(Profile::Admin { username }),
    };
    match profile {
        Some(profile) => proceeds(profile),
        None => breaks(Error::UserDoesNotExist {
            message: "User not found".to_string(),
        }),
    }
}

/// Table and key column holding the caller's photo.
fn photo_owner(user: &SessionUser) -> Result<(&'static str, &'static str, &str), Error> {
    match user {
        SessionUser::Student { usn, .. } => Ok(("students", "usn", usn)),
        SessionUser::Faculty { ssn_id, .. } => Ok(("faculty", "ssn_id", ssn_id)),
        SessionUser::Admin { .. } => Err(Error::invalid("Admins have no profile photo")),
    }
}

pub async fn upload_photo(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    multipart: Multipart,
) -> Payload<Notice> {
    let (table, key, id) = photo_owner(&current.user)?;
    let upload = read_upload(multipart, &["photo", "file"]).await?;
    let photo = match upload.file {
        Some(photo) => photo,
        None => return breaks(Error::invalid("No photo uploaded")),
    };
    if !photo.content_type.starts_with("image/") {
        return breaks(Error::invalid("Photo must be an image"));
    }

    let res = sqlx::query(&format!(
        "UPDATE {} SET photo = $1, photo_type = $2 WHERE {} = $3",
        table, key
    ))
    .bind(&photo.data)
    .bind(&photo.content_type)
    .bind(id)
    .execute(&pg)
    .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::UserDoesNotExist {
            message: "User not found".to_string(),
        });
    }
    log::info!("Photo updated for {}", current.user.owner());
    notice("Photo uploaded successfully")
}

pub async fn photo(current: CurrentUser, Extension(pg): Extension<PgPool>) -> Result<Response, Error> {
    let (table, key, id) = photo_owner(&current.user)?;
    let file = sqlx::query_as::<_, StoredFile>(&format!(
        "SELECT NULL::TEXT AS file_name, photo_type AS file_type, photo AS file_data
         FROM {} WHERE {} = $1",
        table, key
    ))
    .bind(id)
    .fetch_optional(&pg)
    .await?
    .ok_or_else(|| Error::not_found("No photo found"))?;
    blob_response(file, Disposition::Inline).map_err(|_| Error::not_found("No photo found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photos_live_next_to_the_account() {
        let student = SessionUser::Student {
            usn: "1CS21001".to_string(),
            sem: 5,
            section: "A".to_string(),
        };
        assert_eq!(photo_owner(&student).unwrap(), ("students", "usn", "1CS21001"));

        let admin = SessionUser::Admin {
            username: "root".to_string(),
        };
        assert_eq!(
            photo_owner(&admin).unwrap_err().status(),
            axum::http::StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn profile_is_tagged_by_role() {
        let value = serde_json::to_value(Profile::Admin {
            username: "root".to_string(),
        })
        .unwrap();
        assert_eq!(value["role"], "admin");
        assert_eq!(value["username"], "root");
    }
}
