use axum::Extension;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::attendance::SemesterQuery;
use crate::auth::CurrentUser;
use crate::extract::{Json, Path, Query};
use crate::models::Subject;
use crate::{breaks, proceeds, Error, Payload};

pub async fn subjects_by_department(
    Path((department, semester)): Path<(String, i32)>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Catalogue> {
    let subjects = sqlx::query_as::<_, Subject>(
        "SELECT * FROM subjects WHERE department = $1 AND semester = $2 ORDER BY subject_code",
    )
    .bind(&department)
    .bind(semester)
    .fetch_all(&pg)
    .await?;
    proceeds(Catalogue { subjects })
}

pub async fn subjects_by_semester(
    Extension(pg): Extension<PgPool>,
    Query(query): Query<SemesterQuery>,
) -> Payload<Catalogue> {
    let semester = match query.semester {
        Some(semester) => semester,
        None => return breaks(Error::invalid("Semester is required")),
    };
    let subjects = sqlx::query_as::<_, Subject>(
        "SELECT * FROM subjects WHERE semester = $1 ORDER BY subject_code",
    )
    .bind(semester)
    .fetch_all(&pg)
    .await?;
    proceeds(Catalogue { subjects })
}

/// Splits the comma separated faculty list sent by the admin form.
pub fn faculty_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !ids.iter().any(|known| known == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

pub async fn assign_faculty(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<AssignFaculty>,
) -> Payload<FacultyAssigned> {
    current.require_admin()?;
    let (subject_code, section, faculty) = match (
        body.subject_code.filter(|s| !s.trim().is_empty()),
        body.section.filter(|s| !s.trim().is_empty()),
        body.faculty_ssn.as_deref().map(faculty_ids),
    ) {
        (Some(code), Some(section), Some(faculty)) if !faculty.is_empty() => {
            (code, section, faculty)
        }
        _ => return breaks(Error::invalid("Missing fields")),
    };

    let mut tx = pg.begin().await?;
    let known = sqlx::query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM faculty WHERE ssn_id = ANY($1)",
    )
    .bind(&faculty)
    .fetch_one(&mut tx)
    .await?;
    if known.0 != faculty.len() as i64 {
        return breaks(Error::invalid("Unknown faculty in assignment"));
    }

    sqlx::query("DELETE FROM subject_faculty WHERE subject_code = $1 AND section = $2")
        .bind(&subject_code)
        .bind(&section)
        .execute(&mut tx)
        .await?;
    for faculty_id in &faculty {
        sqlx::query(
            "INSERT INTO subject_faculty (subject_code, section, faculty_id) VALUES ($1, $2, $3)",
        )
        .bind(&subject_code)
        .bind(&section)
        .bind(faculty_id)
        .execute(&mut tx)
        .await?;
    }
    tx.commit().await?;

    proceeds(FacultyAssigned {
        subject_code,
        section,
        faculty,
    })
}

pub async fn faculty_assignments(
    _current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Query(query): Query<ClassQuery>,
) -> Payload<AssignmentListing> {
    let (semester, section) = match (query.semester, query.section) {
        (Some(semester), Some(section)) => (semester, section),
        _ => return breaks(Error::invalid("Semester and section are required")),
    };
    let assignments = sqlx::query_as::<_, Assignment>(
        "SELECT s.subject_code, s.course_type, s.subject_name,
                string_agg(f.name, ',' ORDER BY f.name) AS faculty_names
         FROM subjects s
         LEFT JOIN subject_faculty sf
                ON s.subject_code = sf.subject_code AND sf.section = $1
         LEFT JOIN faculty f
                ON sf.faculty_id = f.ssn_id
         WHERE s.semester = $2
         GROUP BY s.subject_code, s.course_type, s.subject_name
         ORDER BY s.subject_code",
    )
    .bind(&section)
    .bind(semester)
    .fetch_all(&pg)
    .await?;
    proceeds(AssignmentListing { assignments })
}

#[derive(Debug, Clone, Serialize)]
pub struct Catalogue {
    subjects: Vec<Subject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignFaculty {
    #[serde(rename = "subjectCode")]
    subject_code: Option<String>,
    section: Option<String>,
    faculty_ssn: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassQuery {
    semester: Option<i32>,
    section: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Assignment {
    subject_code: String,
    course_type: String,
    subject_name: String,
    faculty_names: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentListing {
    assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacultyAssigned {
    subject_code: String,
    section: String,
    faculty: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faculty_list_is_trimmed_and_deduplicated() {
        assert_eq!(faculty_ids(" F01, F02 ,,F01 "), vec!["F01", "F02"]);
        assert!(faculty_ids(" , ").is_empty());
    }
}
