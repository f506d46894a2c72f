use axum::extract::Multipart;
use axum::response::Response;
use axum::Extension;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::attendance::{SemesterQuery, SubjectListing};
use crate::auth::CurrentUser;
use crate::extract::{Json, Path, Query};
use crate::files::{blob_response, read_upload, Disposition};
use crate::models::{NoteMeta, StoredFile, SubjectName};
use crate::{breaks, notice, proceeds, Error, Notice, Payload};

pub async fn note_subjects(
    _current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Query(query): Query<SemesterQuery>,
) -> Payload<SubjectListing> {
    let semester = match query.semester {
        Some(semester) => semester,
        None => return breaks(Error::invalid("Semester required")),
    };
    let subjects = sqlx::query_as::<_, SubjectName>(
        "SELECT subject_code, subject_name FROM subjects WHERE semester = $1 ORDER BY subject_code",
    )
    .bind(semester)
    .fetch_all(&pg)
    .await?;
    proceeds(SubjectListing { subjects })
}

pub async fn upload_note(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    multipart: Multipart,
) -> Payload<NoteUploaded> {
    current.require_staff()?;
    let upload = read_upload(multipart, &["file"]).await?;
    let (semester, section, subject) = match (
        upload.required_int("semester"),
        upload.field("section"),
        upload.field("subject"),
    ) {
        (Ok(semester), Some(section), Some(subject)) => {
            (semester, section.to_string(), subject.to_string())
        }
        _ => return breaks(Error::invalid("All fields required")),
    };
    let file = match upload.file {
        Some(file) => file,
        None => return breaks(Error::invalid("All fields required")),
    };

    let (id,) = sqlx::query_as::<_, (i64,)>(
        "INSERT INTO notes (semester, section, subject_code, file_name, file_type, file_data, uploaded_at)
         VALUES ($1, $2, $3, $4, $5, $6, NOW())
         RETURNING id",
    )
    .bind(semester)
    .bind(&section)
    .bind(&subject)
    .bind(&file.file_name)
    .bind(&file.content_type)
    .bind(&file.data)
    .fetch_one(&pg)
    .await?;

    log::info!(
        "Note {} ({} bytes) uploaded for {} sem {} sec {}",
        id,
        file.data.len(),
        subject,
        semester,
        section
    );
    proceeds(NoteUploaded {
        message: "Note uploaded successfully",
        id,
    })
}

pub async fn list_notes(
    _current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Query(query): Query<NoteScope>,
) -> Payload<NoteListing> {
    let (semester, section, subject) = query.required()?;
    let notes = sqlx::query_as::<_, NoteMeta>(
        "SELECT id, file_name, file_type, uploaded_at
         FROM notes
         WHERE semester = $1 AND section = $2 AND subject_code = $3
         ORDER BY uploaded_at DESC",
    )
    .bind(semester)
    .bind(section)
    .bind(subject)
    .fetch_all(&pg)
    .await?;
    proceeds(NoteListing { notes })
}

async fn stored_note(pg: &PgPool, id: i64) -> Result<StoredFile, Error> {
    sqlx::query_as::<_, StoredFile>("SELECT file_name, file_type, file_data FROM notes WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found("Note not found"))
}

pub async fn download_note(
    _current: CurrentUser,
    Path(id): Path<i64>,
    Extension(pg): Extension<PgPool>,
) -> Result<Response, Error> {
    blob_response(stored_note(&pg, id).await?, Disposition::Attachment)
}

pub async fn preview_note(
    _current: CurrentUser,
    Path(id): Path<i64>,
    Extension(pg): Extension<PgPool>,
) -> Result<Response, Error> {
    let mut note = stored_note(&pg, id).await?;
    note.file_name = None;
    blob_response(note, Disposition::Inline)
}

pub async fn delete_note(
    current: CurrentUser,
    Path(id): Path<i64>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Notice> {
    current.require_staff()?;
    let res = sqlx::query("DELETE FROM notes WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found("Note not found"));
    }
    notice("Note deleted successfully")
}

pub async fn delete_subject_notes(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Json(scope): Json<NoteScope>,
) -> Payload<NotesDeleted> {
    current.require_staff()?;
    let (semester, section, subject) = scope.required()?;
    let res = sqlx::query(
        "DELETE FROM notes WHERE semester = $1 AND section = $2 AND subject_code = $3",
    )
    .bind(semester)
    .bind(section)
    .bind(subject)
    .execute(&pg)
    .await?;
    proceeds(NotesDeleted {
        message: "All notes deleted successfully",
        deleted: res.rows_affected(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoteScope {
    semester: Option<i32>,
    section: Option<String>,
    subject: Option<String>,
}

impl NoteScope {
    fn required(&self) -> Result<(i32, &str, &str), Error> {
        let section = self.section.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let subject = self.subject.as_deref().map(str::trim).filter(|s| !s.is_empty());
        match (self.semester, section, subject) {
            (Some(semester), Some(section), Some(subject)) => Ok((semester, section, subject)),
            _ => Err(Error::invalid("Semester, section, and subject required")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NoteUploaded {
    message: &'static str,
    id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoteListing {
    notes: Vec<NoteMeta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotesDeleted {
    message: &'static str,
    deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_needs_all_three_fields() {
        let scope = NoteScope {
            semester: Some(5),
            section: Some(" A ".to_string()),
            subject: Some("CS501".to_string()),
        };
        assert_eq!(scope.required().unwrap(), (5, "A", "CS501"));

        let missing = NoteScope {
            semester: Some(5),
            section: Some("".to_string()),
            subject: Some("CS501".to_string()),
        };
        assert!(missing.required().is_err());
    }
}
