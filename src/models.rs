use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudentData {
    pub usn: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub section: String,
    pub semester: i32,
    pub phone: Option<String>,
    pub join_year: Option<i32>,
    pub last_alert_sent: Option<DateTime<Utc>>,
}

pub const STUDENT_COLUMNS: &str =
    "usn, name, email, password_hash, section, semester, phone, join_year, last_alert_sent";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FacultyData {
    pub ssn_id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub phone: Option<String>,
    pub position: Option<String>,
}

pub const FACULTY_COLUMNS: &str = "ssn_id, name, email, password_hash, phone, position";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AdminData {
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subject {
    pub subject_code: String,
    pub subject_name: String,
    pub semester: i32,
    pub department: String,
    pub credit: i32,
    pub course_type: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubjectName {
    pub subject_code: String,
    pub subject_name: String,
}

/// Identity carried by a session, discriminated by `role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum SessionUser {
    Student {
        usn: String,
        sem: i32,
        section: String,
    },
    Faculty {
        ssn_id: String,
        name: String,
    },
    Admin {
        username: String,
    },
}

impl SessionUser {
    /// Stable key naming the identity behind a session, e.g. `student:1CS21001`.
    pub fn owner(&self) -> String {
        match self {
            SessionUser::Student { usn, .. } => format!("student:{}", usn),
            SessionUser::Faculty { ssn_id, .. } => format!("faculty:{}", ssn_id),
            SessionUser::Admin { username } => format!("admin:{}", username),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserSession {
    pub ssid: String,
    pub owner: String,
    pub user_data: Json<SessionUser>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PasswordReset {
    pub email: String,
    pub otp_hash: String,
    pub attempts: i32,
    pub expires_at: DateTime<Utc>,
}

/// Hours per subject for one student, as aggregated by the database.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SubjectHours {
    pub subject_code: String,
    pub subject_name: String,
    pub semester: i32,
    pub total_hours: i64,
    pub attended_hours: i64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MonthHours {
    pub month: String,
    pub total_hours: i64,
    pub attended_hours: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MarksView {
    pub subject_code: String,
    pub subject_name: String,
    pub semester: i32,
    pub cie1: i32,
    pub cie2: i32,
    pub lab: i32,
    pub assignment: i32,
    pub external: i32,
    pub internal: i32,
    pub total: i32,
    pub result: String,
    pub credit: i32,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AnnouncementRow {
    pub id: i64,
    pub title: String,
    pub message: String,
    pub author: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub file_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NoteMeta {
    pub id: i64,
    pub file_name: String,
    pub file_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// A blob with whatever metadata was stored next to it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredFile {
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub file_data: Option<Vec<u8>>,
}
