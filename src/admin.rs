use axum::Extension;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::auth::{fetch_faculty, fetch_student, hash_password, CurrentUser};
use crate::extract::{Json, Path};
use crate::mailer::is_valid_address;
use crate::models::{FacultyData, StudentData, Subject};
use crate::sessions::destroy_sessions_of;
use crate::{breaks, notice, proceeds, Error, Notice, Payload};

fn required<'a>(value: &'a str, name: &str) -> Result<&'a str, Error> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::invalid(format!("`{}` is required", name)));
    }
    Ok(value)
}

fn checked_email(email: &str) -> Result<&str, Error> {
    let email = required(email, "email")?;
    if !is_valid_address(email) {
        return Err(Error::invalid(format!("`{}` is not a valid email", email)));
    }
    Ok(email)
}

pub async fn add_student(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Json(student): Json<NewStudent>,
) -> Payload<Added<StudentData>> {
    current.require_admin()?;
    let usn = required(&student.usn, "usn")?;
    if let Some(existing) = fetch_student(&pg, usn).await? {
        return proceeds(Added::existing("Student already exists", existing));
    }

    let name = required(&student.name, "name")?;
    let email = checked_email(&student.email)?;
    let section = required(&student.section, "section")?;
    if student.password.is_empty() {
        return breaks(Error::MissingCredentials {
            message: "Provided password was empty!".to_string(),
        });
    }

    sqlx::query(
        "INSERT INTO students (usn, name, email, password_hash, section, semester, phone, join_year)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(usn)
    .bind(name)
    .bind(email)
    .bind(hash_password(&student.password)?)
    .bind(section)
    .bind(student.sem)
    .bind(&student.phone)
    .bind(student.join_year)
    .execute(&pg)
    .await?;

    log::info!("Student {} added", usn);
    proceeds(Added::created("Student added successfully"))
}

pub async fn add_faculty(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Json(faculty): Json<NewFaculty>,
) -> Payload<Added<FacultyData>> {
    current.require_admin()?;
    let ssn_id = required(&faculty.ssn_id, "ssn_id")?;
    if let Some(existing) = fetch_faculty(&pg, ssn_id).await? {
        return proceeds(Added::existing("Faculty already exists", existing));
    }

    let name = required(&faculty.name, "name")?;
    let email = checked_email(&faculty.email)?;
    if faculty.password.is_empty() {
        return breaks(Error::MissingCredentials {
            message: "Provided password was empty!".to_string(),
        });
    }

    sqlx::query(
        "INSERT INTO faculty (ssn_id, name, email, password_hash, phone, position)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(ssn_id)
    .bind(name)
    .bind(email)
    .bind(hash_password(&faculty.password)?)
    .bind(&faculty.phone)
    .bind(&faculty.position)
    .execute(&pg)
    .await?;

    log::info!("Faculty {} added", ssn_id);
    proceeds(Added::created("Faculty added successfully"))
}

pub async fn get_student(
    current: CurrentUser,
    Path(usn): Path<String>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Editable<StudentData>> {
    current.require_admin()?;
    match fetch_student(&pg, &usn).await? {
        Some(student) => proceeds(Editable::of(student)),
        None => breaks(Error::not_found("Student not found")),
    }
}

pub async fn get_faculty(
    current: CurrentUser,
    Path(ssn_id): Path<String>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Editable<FacultyData>> {
    current.require_admin()?;
    match fetch_faculty(&pg, &ssn_id).await? {
        Some(faculty) => proceeds(Editable::of(faculty)),
        None => breaks(Error::not_found("Faculty not found")),
    }
}

pub async fn update_student(
    current: CurrentUser,
    Path(usn): Path<String>,
    Extension(pg): Extension<PgPool>,
    Json(update): Json<StudentUpdate>,
) -> Payload<Notice> {
    current.require_admin()?;
    if let Some(email) = &update.email {
        checked_email(email)?;
    }
    let res = sqlx::query(
        "UPDATE students SET
           name = COALESCE($2, name),
           email = COALESCE($3, email),
           section = COALESCE($4, section),
           semester = COALESCE($5, semester),
           phone = COALESCE($6, phone),
           join_year = COALESCE($7, join_year)
         WHERE usn = $1",
    )
    .bind(usn.trim())
    .bind(&update.name)
    .bind(update.email.as_deref().map(str::trim))
    .bind(&update.section)
    .bind(update.sem)
    .bind(&update.phone)
    .bind(update.join_year)
    .execute(&pg)
    .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found("Student not found"));
    }
    notice("Student updated successfully")
}

pub async fn update_faculty(
    current: CurrentUser,
    Path(ssn_id): Path<String>,
    Extension(pg): Extension<PgPool>,
    Json(update): Json<FacultyUpdate>,
) -> Payload<Notice> {
    current.require_admin()?;
    if let Some(email) = &update.email {
        checked_email(email)?;
    }
    let res = sqlx::query(
        "UPDATE faculty SET
           name = COALESCE($2, name),
           email = COALESCE($3, email),
           phone = COALESCE($4, phone),
           position = COALESCE($5, position)
         WHERE ssn_id = $1",
    )
    .bind(ssn_id.trim())
    .bind(&update.name)
    .bind(update.email.as_deref().map(str::trim))
    .bind(&update.phone)
    .bind(&update.position)
    .execute(&pg)
    .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found("Faculty not found"));
    }
    notice("Faculty updated successfully")
}

pub async fn delete_student(
    current: CurrentUser,
    Path(usn): Path<String>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Notice> {
    current.require_admin()?;
    let res = sqlx::query("DELETE FROM students WHERE usn = $1")
        .bind(usn.trim())
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found("student not found"));
    }
    destroy_sessions_of(&pg, &format!("student:{}", usn.trim())).await?;
    notice("student deleted successfully")
}

pub async fn delete_faculty(
    current: CurrentUser,
    Path(ssn_id): Path<String>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Notice> {
    current.require_admin()?;
    let res = sqlx::query("DELETE FROM faculty WHERE ssn_id = $1")
        .bind(ssn_id.trim())
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found("faculty not found"));
    }
    destroy_sessions_of(&pg, &format!("faculty:{}", ssn_id.trim())).await?;
    notice("faculty deleted successfully")
}

pub async fn add_subject(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Json(subject): Json<Subject>,
) -> Payload<Added<Subject>> {
    current.require_admin()?;
    let code = required(&subject.subject_code, "subject_code")?;
    required(&subject.subject_name, "subject_name")?;

    let existing = sqlx::query_as::<_, Subject>("SELECT * FROM subjects WHERE subject_code = $1")
        .bind(code)
        .fetch_optional(&pg)
        .await?;
    if let Some(existing) = existing {
        return proceeds(Added::existing("Subject already exists", existing));
    }

    sqlx::query(
        "INSERT INTO subjects (subject_code, subject_name, semester, department, credit, course_type)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(code)
    .bind(subject.subject_name.trim())
    .bind(subject.semester)
    .bind(subject.department.trim())
    .bind(subject.credit)
    .bind(subject.course_type.trim())
    .execute(&pg)
    .await?;
    proceeds(Added::created("Subject added successfully"))
}

/// Insert outcome; an existing record is returned as-is for form pre-fill.
#[derive(Debug, Clone, Serialize)]
pub struct Added<T> {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    existing: Option<T>,
}

impl<T> Added<T> {
    fn created(message: &'static str) -> Self {
        Self {
            message,
            existing: None,
        }
    }

    fn existing(message: &'static str, existing: T) -> Self {
        Self {
            message,
            existing: Some(existing),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Editable<T> {
    #[serde(flatten)]
    record: T,
    #[serde(rename = "isEdit")]
    is_edit: bool,
}

impl<T> Editable<T> {
    fn of(record: T) -> Self {
        Self {
            record,
            is_edit: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStudent {
    usn: String,
    name: String,
    email: String,
    password: String,
    section: String,
    sem: i32,
    phone: Option<String>,
    join_year: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFaculty {
    ssn_id: String,
    name: String,
    email: String,
    password: String,
    phone: Option<String>,
    position: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StudentUpdate {
    name: Option<String>,
    email: Option<String>,
    section: Option<String>,
    sem: Option<i32>,
    phone: Option<String>,
    join_year: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacultyUpdate {
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    position: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student() -> StudentData {
        StudentData {
            usn: "1CS21001".to_string(),
            name: "Asha".to_string(),
            email: "asha@college.edu".to_string(),
            password_hash: "$pbkdf2-sha256$secret".to_string(),
            section: "A".to_string(),
            semester: 5,
            phone: None,
            join_year: Some(2021),
            last_alert_sent: None,
        }
    }

    #[test]
    fn existing_record_is_returned_without_hash() {
        let value = serde_json::to_value(Added::existing("Student already exists", student())).unwrap();
        assert_eq!(value["message"], "Student already exists");
        assert_eq!(value["existing"]["usn"], "1CS21001");
        assert!(value["existing"].get("password_hash").is_none());
    }

    #[test]
    fn created_outcome_omits_existing() {
        let value = serde_json::to_value(Added::<StudentData>::created("Student added successfully")).unwrap();
        assert!(value.get("existing").is_none());
    }

    #[test]
    fn editable_records_carry_flag() {
        let value = serde_json::to_value(Editable::of(student())).unwrap();
        assert_eq!(value["isEdit"], true);
        assert_eq!(value["section"], "A");
    }

    #[test]
    fn emails_are_validated() {
        assert_eq!(checked_email(" a@b.edu ").unwrap(), "a@b.edu");
        assert!(checked_email("nobody").is_err());
        assert!(required("  ", "usn").is_err());
    }
}
