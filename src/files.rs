use std::collections::HashMap;

use axum::extract::Multipart;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use serde::Serialize;
use sqlx::PgPool;

use crate::auth::CurrentUser;
use crate::extract::Path;
use crate::models::StoredFile;
use crate::{breaks, proceeds, Error, Payload};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Text fields of a multipart form plus its single file part.
#[derive(Debug, Default)]
pub struct Upload {
    pub fields: HashMap<String, String>,
    pub file: Option<UploadedFile>,
}

impl Upload {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn required(&self, name: &str) -> Result<&str, Error> {
        self.field(name)
            .ok_or_else(|| Error::invalid(format!("`{}` is required", name)))
    }

    pub fn required_int(&self, name: &str) -> Result<i32, Error> {
        self.required(name)?
            .parse()
            .map_err(|_| Error::invalid(format!("`{}` must be a number", name)))
    }
}

pub async fn read_upload(mut multipart: Multipart, file_fields: &[&str]) -> Result<Upload, Error> {
    let mut upload = Upload::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if file_fields.contains(&name.as_str()) {
            let file_name = field
                .file_name()
                .map(str::to_string)
                .unwrap_or_else(|| name.clone());
            let content_type = field
                .content_type()
                .map(|mime| mime.to_string())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
            let data = field.bytes().await?.to_vec();
            if data.is_empty() {
                continue;
            }
            upload.file = Some(UploadedFile {
                file_name,
                content_type,
                data,
            });
        } else {
            let value = field.text().await?;
            upload.fields.insert(name, value);
        }
    }
    Ok(upload)
}

/// Header-safe rendition of a stored file name.
pub fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim().is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

pub fn disposition_header(disposition: Disposition, file_name: Option<&str>) -> String {
    let kind = match disposition {
        Disposition::Inline => "inline",
        Disposition::Attachment => "attachment",
    };
    match file_name {
        Some(name) => format!("{}; filename=\"{}\"", kind, safe_file_name(name)),
        None => kind.to_string(),
    }
}

pub fn blob_response(file: StoredFile, disposition: Disposition) -> Result<Response, Error> {
    let data = file
        .file_data
        .ok_or_else(|| Error::not_found("File not found"))?;
    let content_type = file
        .file_type
        .filter(|kind| !kind.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    Ok((
        [
            (CONTENT_TYPE, content_type),
            (
                CONTENT_DISPOSITION,
                disposition_header(disposition, file.file_name.as_deref()),
            ),
        ],
        data,
    )
        .into_response())
}

pub async fn upload_timetable(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    multipart: Multipart,
) -> Payload<TimetableSaved> {
    current.require_staff()?;
    let upload = read_upload(multipart, &["file"]).await?;
    let semester = upload.required_int("semester")?;
    let section = upload.required("section")?.to_string();
    let file = match upload.file {
        Some(file) => file,
        None => return breaks(Error::invalid("`file` is required")),
    };

    sqlx::query(
        "INSERT INTO timetables (semester, section, file_name, file_type, file_data, uploaded_at)
         VALUES ($1, $2, $3, $4, $5, NOW())
         ON CONFLICT (semester, section) DO UPDATE SET
           file_name = EXCLUDED.file_name,
           file_type = EXCLUDED.file_type,
           file_data = EXCLUDED.file_data,
           uploaded_at = NOW()",
    )
    .bind(semester)
    .bind(&section)
    .bind(&file.file_name)
    .bind(&file.content_type)
    .bind(&file.data)
    .execute(&pg)
    .await?;

    log::info!("Timetable for semester {} section {} replaced", semester, section);
    proceeds(TimetableSaved {
        message: "Timetable uploaded successfully",
        semester,
        section,
    })
}

pub async fn get_timetable(
    _current: CurrentUser,
    Path((semester, section)): Path<(i32, String)>,
    Extension(pg): Extension<PgPool>,
) -> Result<Response, Error> {
    let file = sqlx::query_as::<_, StoredFile>(
        "SELECT file_name, file_type, file_data FROM timetables WHERE semester = $1 AND section = $2",
    )
    .bind(semester)
    .bind(&section)
    .fetch_optional(&pg)
    .await?
    .ok_or_else(|| Error::not_found("Timetable not found"))?;
    blob_response(file, Disposition::Inline)
}

#[derive(Debug, Clone, Serialize)]
pub struct TimetableSaved {
    message: &'static str,
    semester: i32,
    section: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_made_header_safe() {
        assert_eq!(safe_file_name("unit 1.pdf"), "unit 1.pdf");
        assert_eq!(safe_file_name("a\"b\\c.pdf"), "a_b_c.pdf");
        assert_eq!(safe_file_name("résumé.pdf"), "r_sum_.pdf");
        assert_eq!(safe_file_name("  "), "download");
    }

    #[test]
    fn disposition_names_the_file_when_known() {
        assert_eq!(
            disposition_header(Disposition::Attachment, Some("notes.pdf")),
            "attachment; filename=\"notes.pdf\""
        );
        assert_eq!(disposition_header(Disposition::Inline, None), "inline");
    }

    #[test]
    fn blob_defaults_content_type() {
        let response = blob_response(
            StoredFile {
                file_name: None,
                file_type: None,
                file_data: Some(vec![1, 2, 3]),
            },
            Disposition::Inline,
        )
        .unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], DEFAULT_CONTENT_TYPE);
        assert_eq!(response.headers()[CONTENT_DISPOSITION], "inline");
    }

    #[test]
    fn blob_without_data_is_not_found() {
        let err = blob_response(
            StoredFile {
                file_name: Some("x".to_string()),
                file_type: Some("text/plain".to_string()),
                file_data: None,
            },
            Disposition::Attachment,
        )
        .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn upload_fields_are_trimmed_and_checked() {
        let mut upload = Upload::default();
        upload.fields.insert("semester".to_string(), " 5 ".to_string());
        upload.fields.insert("section".to_string(), "".to_string());
        upload.fields.insert("subject".to_string(), "x".to_string());
        assert_eq!(upload.required_int("semester").unwrap(), 5);
        assert!(upload.required("section").is_err());
        assert!(upload.required_int("subject").is_err());
    }
}
