use axum::extract::Multipart;
use axum::response::Response;
use axum::Extension;
use serde::Serialize;
use sqlx::PgPool;

use crate::auth::CurrentUser;
use crate::extract::Path;
use crate::files::{blob_response, read_upload, Disposition, UploadedFile};
use crate::mailer::{announcement, Attachment, BulkReport, Mailer};
use crate::models::{AnnouncementRow, StoredFile};
use crate::{breaks, notice, proceeds, Error, Notice, Payload};

const ANNOUNCEMENT_TYPES: [&str; 5] = ["Placement", "Result", "Events", "Alerts", "General"];

/// Unknown or missing types fall back to `General`.
pub fn announcement_type(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|requested| {
            ANNOUNCEMENT_TYPES
                .iter()
                .find(|known| known.eq_ignore_ascii_case(requested.trim()))
        })
        .copied()
        .unwrap_or("General")
}

pub fn attachment_for(title: &str, file: &UploadedFile) -> Attachment {
    let filename = if file.content_type == "application/pdf" {
        format!("{}.pdf", title)
    } else {
        title.to_string()
    };
    Attachment {
        filename,
        content_type: file.content_type.clone(),
        data: file.data.clone(),
    }
}

pub async fn create_announcement(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Extension(mailer): Extension<Mailer>,
    multipart: Multipart,
) -> Payload<AnnouncementCreated> {
    let author = current.require_staff()?;
    let upload = read_upload(multipart, &["file"]).await?;
    let (title, message) = match (upload.field("title"), upload.field("message")) {
        (Some(title), Some(message)) => (title.to_string(), message.to_string()),
        _ => return breaks(Error::invalid("Title and message are required")),
    };
    let kind = announcement_type(upload.field("type"));

    let (id,) = sqlx::query_as::<_, (i64,)>(
        "INSERT INTO announcements (title, message, author, type, file_type, file_data, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, NOW())
         RETURNING id",
    )
    .bind(&title)
    .bind(&message)
    .bind(&author)
    .bind(kind)
    .bind(upload.file.as_ref().map(|file| file.content_type.as_str()))
    .bind(upload.file.as_ref().map(|file| file.data.as_slice()))
    .fetch_one(&pg)
    .await?;
    log::info!("Announcement {} saved by {}", id, author);

    let recipients: Vec<String> = sqlx::query_as::<_, (String,)>("SELECT email FROM students")
        .fetch_all(&pg)
        .await?
        .into_iter()
        .map(|(email,)| email)
        .collect();

    let attachment = upload.file.as_ref().map(|file| attachment_for(&title, file));
    let email = announcement(&title, &message, &author, attachment);
    let delivery = mailer.send_bulk(&recipients, &email).await;
    if delivery.batches == 0 {
        log::warn!("No valid student emails found, skipping announcement mail");
    }

    proceeds(AnnouncementCreated {
        message: "Announcement created",
        id,
        delivery,
    })
}

pub async fn list_announcements(
    _current: CurrentUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<AnnouncementListing> {
    let rows = sqlx::query_as::<_, AnnouncementRow>(
        "SELECT id, title, message, author, type AS kind, file_type, created_at
         FROM announcements
         ORDER BY created_at DESC, id DESC",
    )
    .fetch_all(&pg)
    .await?;

    let announcements = rows
        .into_iter()
        .map(|row| AnnouncementEntry {
            file_url: row
                .file_type
                .as_ref()
                .map(|_| format!("/api/announcements/{}/file", row.id)),
            row,
        })
        .collect();
    proceeds(AnnouncementListing { announcements })
}

pub async fn announcement_file(
    _current: CurrentUser,
    Path(id): Path<i64>,
    Extension(pg): Extension<PgPool>,
) -> Result<Response, Error> {
    let file = sqlx::query_as::<_, StoredFile>(
        "SELECT title AS file_name, file_type, file_data FROM announcements WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&pg)
    .await?
    .ok_or_else(|| Error::not_found("File not found"))?;
    blob_response(file, Disposition::Inline)
}

pub async fn delete_announcement(
    current: CurrentUser,
    Path(id): Path<i64>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Notice> {
    current.require_staff()?;
    let res = sqlx::query("DELETE FROM announcements WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found("Announcement not found"));
    }
    notice("Announcement deleted")
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnouncementCreated {
    message: &'static str,
    id: i64,
    delivery: BulkReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnouncementEntry {
    #[serde(flatten)]
    row: AnnouncementRow,
    file_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnouncementListing {
    announcements: Vec<AnnouncementEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_fall_back_to_general() {
        assert_eq!(announcement_type(Some("Placement")), "Placement");
        assert_eq!(announcement_type(Some(" events ")), "Events");
        assert_eq!(announcement_type(Some("Party")), "General");
        assert_eq!(announcement_type(None), "General");
    }

    #[test]
    fn pdf_attachments_get_an_extension() {
        let pdf = UploadedFile {
            file_name: "circular.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            data: vec![1],
        };
        assert_eq!(attachment_for("Exam Schedule", &pdf).filename, "Exam Schedule.pdf");

        let image = UploadedFile {
            content_type: "image/png".to_string(),
            ..pdf
        };
        let attachment = attachment_for("Poster", &image);
        assert_eq!(attachment.filename, "Poster");
        assert_eq!(attachment.content_type, "image/png");
    }
}
