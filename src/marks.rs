use axum::Extension;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::auth::{fetch_student, CurrentUser};
use crate::extract::{Json, Path};
use crate::mailer::{is_valid_address, marks_uploaded, Mailer};
use crate::models::MarksView;
use crate::{breaks, proceeds, Error, Payload};

pub const PASS_INTERNAL: i32 = 20;
pub const PASS_EXTERNAL: i32 = 18;
pub const PASS_TOTAL: i32 = 40;
const MAX_COMPONENT: i32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Components {
    #[serde(default)]
    pub cie1: i32,
    #[serde(default)]
    pub cie2: i32,
    #[serde(default)]
    pub lab: i32,
    #[serde(default)]
    pub assignment: i32,
    #[serde(default)]
    pub external: i32,
}

impl Components {
    fn values(&self) -> [(&'static str, i32); 5] {
        [
            ("cie1", self.cie1),
            ("cie2", self.cie2),
            ("lab", self.lab),
            ("assignment", self.assignment),
            ("external", self.external),
        ]
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in self.values() {
            if !(0..=MAX_COMPONENT).contains(&value) {
                return Err(Error::invalid(format!(
                    "`{}` must be within 0..={}, got {}",
                    name, MAX_COMPONENT, value
                )));
            }
        }
        Ok(())
    }

    /// Zero means "not entered": stored components survive a zero in the update.
    pub fn merge_keep_non_zero(existing: Option<Components>, incoming: Components) -> Components {
        let existing = match existing {
            Some(existing) => existing,
            None => return incoming,
        };
        let pick = |new: i32, old: i32| if new != 0 { new } else { old };
        Components {
            cie1: pick(incoming.cie1, existing.cie1),
            cie2: pick(incoming.cie2, existing.cie2),
            lab: pick(incoming.lab, existing.lab),
            assignment: pick(incoming.assignment, existing.assignment),
            external: pick(incoming.external, existing.external),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    #[serde(rename = "P")]
    Pass,
    #[serde(rename = "F")]
    Fail,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "P",
            Outcome::Fail => "F",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Scored {
    #[serde(flatten)]
    pub components: Components,
    pub internal: i32,
    pub total: i32,
    pub result: Outcome,
}

pub fn is_lab_course(course_type: &str) -> bool {
    let course_type = course_type.trim().to_lowercase();
    course_type == "ipcc" || course_type.contains("lab")
}

/// `ceil((cie1 + cie2) / 50 * weight)`, weight 15 for lab subjects and 25 otherwise.
pub fn scaled_cie(cie1: i32, cie2: i32, lab_subject: bool) -> i32 {
    let weight = if lab_subject { 15 } else { 25 };
    let raw = (cie1 + cie2).max(0) * weight;
    (raw + 49) / 50
}

pub fn result_for(internal: i32, external: i32, total: i32) -> Outcome {
    if internal >= PASS_INTERNAL && external >= PASS_EXTERNAL && total >= PASS_TOTAL {
        Outcome::Pass
    } else {
        Outcome::Fail
    }
}

pub fn score(components: Components, lab_subject: bool) -> Scored {
    let internal =
        scaled_cie(components.cie1, components.cie2, lab_subject) + components.lab + components.assignment;
    let total = internal + components.external;
    Scored {
        components,
        internal,
        total,
        result: result_for(internal, components.external, total),
    }
}

async fn upsert_marks(
    tx: &mut Transaction<'_, Postgres>,
    usn: &str,
    semester: i32,
    subjects: &[SubjectMarks],
) -> Result<Vec<SavedSubject>, Error> {
    let mut saved = Vec::with_capacity(subjects.len());
    for subject in subjects {
        let code = subject.code.trim();
        subject.components.validate()?;

        let course_type = sqlx::query_as::<_, (String,)>(
            "SELECT course_type FROM subjects WHERE subject_code = $1",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?
        .map(|(course_type,)| course_type)
        .ok_or_else(|| Error::invalid(format!("Unknown subject `{}`", code)))?;

        let existing = sqlx::query_as::<_, Components>(
            "SELECT cie1, cie2, lab, assignment, external FROM marks
             WHERE usn = $1 AND semester = $2 AND subject_code = $3
             FOR UPDATE",
        )
        .bind(usn)
        .bind(semester)
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let merged = Components::merge_keep_non_zero(existing, subject.components);
        let scored = score(merged, is_lab_course(&course_type));

        sqlx::query(
            "INSERT INTO marks
               (usn, semester, subject_code, cie1, cie2, lab, assignment, external, internal, total, result)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (usn, semester, subject_code) DO UPDATE SET
               cie1 = EXCLUDED.cie1,
               cie2 = EXCLUDED.cie2,
               lab = EXCLUDED.lab,
               assignment = EXCLUDED.assignment,
               external = EXCLUDED.external,
               internal = EXCLUDED.internal,
               total = EXCLUDED.total,
               result = EXCLUDED.result,
               updated_at = NOW()",
        )
        .bind(usn)
        .bind(semester)
        .bind(code)
        .bind(merged.cie1)
        .bind(merged.cie2)
        .bind(merged.lab)
        .bind(merged.assignment)
        .bind(merged.external)
        .bind(scored.internal)
        .bind(scored.total)
        .bind(scored.result.as_str())
        .execute(&mut *tx)
        .await?;

        saved.push(SavedSubject {
            code: code.to_string(),
            scored,
        });
    }
    Ok(saved)
}

pub async fn save_marks(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Extension(mailer): Extension<Mailer>,
    Json(body): Json<SaveMarks>,
) -> Payload<MarksSaved> {
    current.require_staff()?;
    let (usn, semester, subjects) = match (
        body.usn.filter(|usn| !usn.trim().is_empty()),
        body.semester,
        body.subjects,
    ) {
        (Some(usn), Some(semester), Some(subjects)) => (usn.trim().to_string(), semester, subjects),
        _ => return breaks(Error::invalid("Invalid request data")),
    };
    let student = match fetch_student(&pg, &usn).await? {
        Some(student) => student,
        None => return breaks(Error::not_found("Student not found")),
    };

    let mut tx = pg.begin().await?;
    let saved = match upsert_marks(&mut tx, &student.usn, semester, &subjects).await {
        Ok(saved) => saved,
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                log::error!("Rollback of marks for {} failed: {}", student.usn, rollback);
            }
            log::warn!("Marks batch for {} rolled back", student.usn);
            return Err(err);
        }
    };
    tx.commit().await?;
    log::info!(
        "Saved marks for {} subject(s) of {} (semester {})",
        saved.len(),
        student.usn,
        semester
    );

    let notified = if is_valid_address(&student.email) {
        match mailer.send(&marks_uploaded(&student.email)).await {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Marks notification to {} failed: {:#}", student.usn, err);
                false
            }
        }
    } else {
        false
    };

    proceeds(MarksSaved {
        message: "Marks saved",
        subjects: saved,
        notified,
    })
}

async fn marks_for(pg: &PgPool, usn: String) -> Payload<StudentMarks> {
    let subjects = sqlx::query_as::<_, MarksView>(
        "SELECT m.subject_code, s.subject_name, m.semester,
                m.cie1, m.cie2, m.lab, m.assignment, m.external,
                m.internal, m.total, m.result, s.credit
         FROM marks m
         JOIN subjects s ON m.subject_code = s.subject_code
         WHERE m.usn = $1
         ORDER BY m.semester, m.subject_code",
    )
    .bind(&usn)
    .fetch_all(pg)
    .await?;

    if subjects.is_empty() {
        return breaks(Error::not_found("No marks found for this USN"));
    }
    proceeds(StudentMarks { usn, subjects })
}

pub async fn my_marks(current: CurrentUser, Extension(pg): Extension<PgPool>) -> Payload<StudentMarks> {
    let usn = current.student_usn()?.to_string();
    marks_for(&pg, usn).await
}

pub async fn student_marks(
    current: CurrentUser,
    Path(usn): Path<String>,
    Extension(pg): Extension<PgPool>,
) -> Payload<StudentMarks> {
    current.require_staff()?;
    let usn = current.resolve_usn(Some(&usn))?;
    marks_for(&pg, usn).await
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveMarks {
    usn: Option<String>,
    semester: Option<i32>,
    subjects: Option<Vec<SubjectMarks>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectMarks {
    code: String,
    #[serde(flatten)]
    components: Components,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedSubject {
    code: String,
    #[serde(flatten)]
    scored: Scored,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarksSaved {
    message: &'static str,
    subjects: Vec<SavedSubject>,
    notified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentMarks {
    usn: String,
    subjects: Vec<MarksView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(cie1: i32, cie2: i32, lab: i32, assignment: i32, external: i32) -> Components {
        Components {
            cie1,
            cie2,
            lab,
            assignment,
            external,
        }
    }

    #[test]
    fn pass_needs_every_threshold() {
        assert_eq!(result_for(20, 18, 40), Outcome::Pass);
        assert_eq!(result_for(19, 18, 40), Outcome::Fail);
        assert_eq!(result_for(19, 60, 79), Outcome::Fail);
        assert_eq!(result_for(20, 17, 40), Outcome::Fail);
        assert_eq!(result_for(25, 18, 39), Outcome::Fail);
    }

    #[test]
    fn cie_scaling_rounds_up() {
        assert_eq!(scaled_cie(25, 25, false), 25);
        assert_eq!(scaled_cie(25, 25, true), 15);
        // 31 / 50 * 25 = 15.5
        assert_eq!(scaled_cie(16, 15, false), 16);
        // 30 / 50 * 15 = 9 exactly
        assert_eq!(scaled_cie(15, 15, true), 9);
        // 31 / 50 * 15 = 9.3
        assert_eq!(scaled_cie(16, 15, true), 10);
        assert_eq!(scaled_cie(0, 0, true), 0);
    }

    #[test]
    fn lab_courses_are_recognised() {
        assert!(is_lab_course("IPCC"));
        assert!(is_lab_course("Lab"));
        assert!(is_lab_course("  Integrated Lab "));
        assert!(!is_lab_course("Theory"));
        assert!(!is_lab_course("PCC"));
    }

    #[test]
    fn scores_compose_internal_and_total() {
        let scored = score(marks(20, 20, 15, 10, 30), true);
        // ceil(40 / 50 * 15) = 12
        assert_eq!(scored.internal, 12 + 15 + 10);
        assert_eq!(scored.total, 37 + 30);
        assert_eq!(scored.result, Outcome::Pass);

        let theory = score(marks(20, 20, 0, 5, 18), false);
        assert_eq!(theory.internal, 25);
        assert_eq!(theory.total, 43);
        assert_eq!(theory.result, Outcome::Pass);

        let weak = score(marks(10, 10, 0, 5, 40), false);
        assert_eq!(weak.internal, 15);
        assert_eq!(weak.result, Outcome::Fail);
    }

    #[test]
    fn zero_keeps_stored_component() {
        let stored = marks(18, 0, 20, 10, 0);
        let update = marks(0, 22, 0, 0, 45);
        assert_eq!(
            Components::merge_keep_non_zero(Some(stored), update),
            marks(18, 22, 20, 10, 45)
        );
        assert_eq!(Components::merge_keep_non_zero(None, update), update);
    }

    #[test]
    fn resubmitting_the_same_payload_is_stable() {
        let payload = marks(20, 21, 18, 9, 33);
        let first = Components::merge_keep_non_zero(None, payload);
        let second = Components::merge_keep_non_zero(Some(first), payload);
        assert_eq!(first, second);
        assert_eq!(score(first, true), score(second, true));
    }

    #[test]
    fn components_are_range_checked() {
        assert!(marks(25, 25, 25, 10, 60).validate().is_ok());
        assert!(marks(-1, 0, 0, 0, 0).validate().is_err());
        assert!(marks(0, 0, 0, 0, 101).validate().is_err());
    }

    #[test]
    fn payload_defaults_missing_components_and_ignores_client_totals() {
        let subject: SubjectMarks = serde_json::from_value(serde_json::json!({
            "code": "CS501",
            "name": "Compilers",
            "cie1": 20,
            "internal": 99,
            "result": "P"
        }))
        .unwrap();
        assert_eq!(subject.code, "CS501");
        assert_eq!(subject.components, marks(20, 0, 0, 0, 0));
    }

    #[test]
    fn save_request_tolerates_department_from_the_form() {
        let body: SaveMarks = serde_json::from_value(serde_json::json!({
            "usn": "1CS21001",
            "semester": 5,
            "department": "CSE",
            "subjects": [{ "code": "CS501", "cie1": 20 }]
        }))
        .unwrap();
        assert_eq!(body.usn.as_deref(), Some("1CS21001"));
        assert_eq!(body.subjects.map(|s| s.len()), Some(1));
    }

    #[test]
    fn outcome_serializes_as_letter() {
        let value = serde_json::to_value(score(marks(25, 25, 0, 0, 50), false)).unwrap();
        assert_eq!(value["result"], "P");
        assert_eq!(value["cie1"], 25);
        assert_eq!(value["total"], 75);
    }
}
