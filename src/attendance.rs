use std::sync::Arc;

use axum::Extension;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::auth::{fetch_student, CurrentUser};
use crate::config::Config;
use crate::extract::{Json, Query};
use crate::mailer::{shortage_alert, Mailer, ShortSubject};
use crate::models::{MonthHours, SubjectHours, SubjectName};
use crate::{breaks, proceeds, Error, Payload};

/// Rounded attended/total percentage, always within 0..=100.
pub fn percentage(attended: i64, total: i64) -> u8 {
    if total <= 0 {
        return 0;
    }
    let attended = attended.clamp(0, total);
    ((attended as f64 / total as f64) * 100.0).round() as u8
}

pub fn is_short(attended: i64, total: i64, threshold: f64) -> bool {
    total > 0 && (attended.clamp(0, total) as f64 / total as f64) * 100.0 < threshold
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectSummary {
    pub subject_code: String,
    pub subject_name: String,
    pub semester: i32,
    pub total_classes: i64,
    pub attended_classes: i64,
    pub percentage: u8,
}

pub fn summarize(rows: Vec<SubjectHours>) -> Vec<SubjectSummary> {
    rows.into_iter()
        .map(|row| SubjectSummary {
            percentage: percentage(row.attended_hours, row.total_hours),
            attended_classes: row.attended_hours.clamp(0, row.total_hours.max(0)),
            total_classes: row.total_hours,
            subject_code: row.subject_code,
            subject_name: row.subject_name,
            semester: row.semester,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyPoint {
    pub month: String,
    pub total_classes: i64,
    pub attended_classes: i64,
    pub percentage: u8,
}

/// Running totals month by month; each point covers every month up to and including itself.
pub fn cumulative_monthly(rows: &[MonthHours]) -> Vec<MonthlyPoint> {
    let mut ordered: Vec<&MonthHours> = rows.iter().collect();
    ordered.sort_by(|a, b| a.month.cmp(&b.month));

    let mut total = 0;
    let mut attended = 0;
    ordered
        .into_iter()
        .map(|row| {
            total += row.total_hours;
            attended += row.attended_hours;
            MonthlyPoint {
                month: row.month.clone(),
                total_classes: total,
                attended_classes: attended,
                percentage: percentage(attended, total),
            }
        })
        .collect()
}

pub fn shortages(rows: &[SubjectHours], threshold: f64) -> Vec<ShortSubject> {
    rows.iter()
        .filter(|row| is_short(row.attended_hours, row.total_hours, threshold))
        .map(|row| ShortSubject {
            subject_name: row.subject_name.clone(),
            percentage: percentage(row.attended_hours, row.total_hours),
        })
        .collect()
}

pub fn alert_due(last_sent: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    match last_sent {
        Some(last_sent) => now - last_sent >= cooldown,
        None => true,
    }
}

/// Latest `last_alert_sent` that still allows a new alert at `now`.
pub fn cooldown_cutoff(now: DateTime<Utc>, cooldown: Duration) -> DateTime<Utc> {
    now - cooldown
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertPlan {
    RecentlySent,
    NothingShort,
    Send(Vec<ShortSubject>),
}

pub fn plan_alert(
    last_sent: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
    rows: &[SubjectHours],
    threshold: f64,
) -> AlertPlan {
    if !alert_due(last_sent, now, cooldown) {
        return AlertPlan::RecentlySent;
    }
    let short = shortages(rows, threshold);
    if short.is_empty() {
        AlertPlan::NothingShort
    } else {
        AlertPlan::Send(short)
    }
}

pub async fn subject_hours(pg: &PgPool, usn: &str) -> Result<Vec<SubjectHours>, Error> {
    let rows = sqlx::query_as::<_, SubjectHours>(
        "SELECT a.subject_code, s.subject_name, s.semester,
                COALESCE(SUM(a.hours), 0)::BIGINT AS total_hours,
                COALESCE(SUM(CASE WHEN a.status = 'Present' THEN a.hours ELSE 0 END), 0)::BIGINT AS attended_hours
         FROM attendance a
         JOIN subjects s ON a.subject_code = s.subject_code
         WHERE a.usn = $1
         GROUP BY a.subject_code, s.subject_name, s.semester
         ORDER BY a.subject_code",
    )
    .bind(usn)
    .fetch_all(pg)
    .await?;
    Ok(rows)
}

pub async fn my_attendance(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Query(query): Query<UsnQuery>,
) -> Payload<AttendanceOverview> {
    let usn = current.resolve_usn(query.usn.as_deref())?;
    let student = match fetch_student(&pg, &usn).await? {
        Some(student) => student,
        None => return breaks(Error::not_found("Student not found")),
    };

    let data = summarize(subject_hours(&pg, &student.usn).await?);
    proceeds(AttendanceOverview {
        role: role_name(&current),
        usn: student.usn,
        name: student.name,
        semester: student.semester,
        data,
    })
}

pub async fn attended_subjects(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Query(query): Query<UsnQuery>,
) -> Payload<SubjectListing> {
    let usn = current.resolve_usn(query.usn.as_deref())?;
    let subjects = sqlx::query_as::<_, SubjectName>(
        "SELECT DISTINCT a.subject_code, s.subject_name
         FROM attendance a
         JOIN subjects s ON a.subject_code = s.subject_code
         WHERE a.usn = $1
         ORDER BY a.subject_code",
    )
    .bind(&usn)
    .fetch_all(&pg)
    .await?;
    proceeds(SubjectListing { subjects })
}

pub async fn monthly_attendance(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Query(query): Query<MonthlyQuery>,
) -> Payload<MonthlyAttendance> {
    let usn = current.resolve_usn(query.usn.as_deref())?;
    let subject = match query.subject.filter(|s| !s.trim().is_empty()) {
        Some(subject) => subject,
        None => return breaks(Error::invalid("Subject code is required")),
    };

    let rows = sqlx::query_as::<_, MonthHours>(
        "SELECT to_char(date, 'YYYY-MM') AS month,
                COALESCE(SUM(hours), 0)::BIGINT AS total_hours,
                COALESCE(SUM(CASE WHEN status = 'Present' THEN hours ELSE 0 END), 0)::BIGINT AS attended_hours
         FROM attendance
         WHERE usn = $1 AND subject_code = $2
         GROUP BY 1
         ORDER BY 1",
    )
    .bind(&usn)
    .bind(&subject)
    .fetch_all(&pg)
    .await?;

    proceeds(MonthlyAttendance {
        subject,
        months: cumulative_monthly(&rows),
    })
}

pub async fn semester_subjects(
    _current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Query(query): Query<SemesterQuery>,
) -> Payload<SubjectListing> {
    let semester = match query.semester {
        Some(semester) => semester,
        None => return breaks(Error::invalid("Semester is required")),
    };
    let subjects = sqlx::query_as::<_, SubjectName>(
        "SELECT subject_code, subject_name FROM subjects WHERE semester = $1 ORDER BY subject_code",
    )
    .bind(semester)
    .fetch_all(&pg)
    .await?;
    proceeds(SubjectListing { subjects })
}

pub async fn submit_attendance(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<SubmitAttendance>,
) -> Payload<AttendanceSaved> {
    current.require_staff()?;
    let (subject_code, semester, section, date, hours) = match (
        body.subject_code.filter(|s| !s.trim().is_empty()),
        body.semester,
        body.section.filter(|s| !s.trim().is_empty()),
        body.date,
        body.hours,
    ) {
        (Some(code), Some(semester), Some(section), Some(date), Some(hours)) => {
            (code, semester, section, date, hours)
        }
        _ => return breaks(Error::invalid("All fields are required")),
    };
    if hours <= 0 {
        return breaks(Error::invalid("`hours` must be positive"));
    }

    let mut tx = pg.begin().await?;

    let known = sqlx::query_as::<_, (String,)>(
        "SELECT subject_code FROM subjects WHERE subject_code = $1",
    )
    .bind(&subject_code)
    .fetch_optional(&mut tx)
    .await?;
    if known.is_none() {
        return breaks(Error::invalid(format!("Unknown subject `{}`", subject_code)));
    }

    let students = sqlx::query_as::<_, (String,)>(
        "SELECT usn FROM students WHERE semester = $1 AND section = $2 ORDER BY usn",
    )
    .bind(semester)
    .bind(section.trim())
    .fetch_all(&mut tx)
    .await?;
    if students.is_empty() {
        return breaks(Error::not_found("No students found for this class"));
    }

    let mut absent = 0;
    for (usn,) in &students {
        let status = if body.absentees.iter().any(|a| a.trim() == usn.trim()) {
            absent += 1;
            "Absent"
        } else {
            "Present"
        };
        sqlx::query(
            "INSERT INTO attendance (usn, subject_code, date, hours, status)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (usn, subject_code, date)
             DO UPDATE SET hours = EXCLUDED.hours, status = EXCLUDED.status",
        )
        .bind(usn)
        .bind(&subject_code)
        .bind(date)
        .bind(hours)
        .bind(status)
        .execute(&mut tx)
        .await?;
    }
    tx.commit().await?;

    log::info!(
        "Attendance for {} on {} recorded: {} present, {} absent",
        subject_code,
        date,
        students.len() - absent,
        absent
    );
    proceeds(AttendanceSaved {
        message: "Attendance updated successfully!",
        present: students.len() - absent,
        absent,
    })
}

pub async fn send_shortage_alert(
    current: CurrentUser,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(mailer): Extension<Mailer>,
    Json(body): Json<AlertRequest>,
) -> Payload<AlertOutcome> {
    current.require_staff()?;
    let usn = match body.usn.filter(|usn| !usn.trim().is_empty()) {
        Some(usn) => usn,
        None => return breaks(Error::invalid("USN required")),
    };
    let student = match fetch_student(&pg, &usn).await? {
        Some(student) => student,
        None => return breaks(Error::not_found("Student not found")),
    };

    let now = Utc::now();
    let cooldown = Duration::days(config.alert_cooldown_days);
    let rows = subject_hours(&pg, &student.usn).await?;
    let plan = plan_alert(
        student.last_alert_sent,
        now,
        cooldown,
        &rows,
        config.attendance_threshold,
    );

    let short = match plan {
        AlertPlan::RecentlySent => {
            return proceeds(AlertOutcome {
                message: "Alert already sent recently.".to_string(),
                sent: false,
            })
        }
        AlertPlan::NothingShort => {
            return proceeds(AlertOutcome {
                message: format!("No subjects below {}%", config.attendance_threshold),
                sent: false,
            })
        }
        AlertPlan::Send(short) => short,
    };

    let claimed = sqlx::query_as::<_, (String,)>(
        "UPDATE students SET last_alert_sent = $1
         WHERE usn = $2 AND (last_alert_sent IS NULL OR last_alert_sent <= $3)
         RETURNING usn",
    )
    .bind(now)
    .bind(&student.usn)
    .bind(cooldown_cutoff(now, cooldown))
    .fetch_optional(&pg)
    .await?;
    if claimed.is_none() {
        return proceeds(AlertOutcome {
            message: "Alert already sent recently.".to_string(),
            sent: false,
        });
    }

    let email = shortage_alert(
        &student.email,
        &student.name,
        &short,
        config.attendance_threshold,
    );
    if let Err(err) = mailer.send(&email).await {
        log::error!("Attendance alert for {} failed: {:#}", student.usn, err);
        sqlx::query(
            "UPDATE students SET last_alert_sent = $1 WHERE usn = $2 AND last_alert_sent = $3",
        )
        .bind(student.last_alert_sent)
        .bind(&student.usn)
        .bind(now)
        .execute(&pg)
        .await?;
        return breaks(Error::InternalError {
            kind: "MailError",
            message: "Failed to send alert".to_string(),
        });
    }

    log::info!(
        "Attendance alert sent to {} for {} subject(s)",
        student.usn,
        short.len()
    );

    proceeds(AlertOutcome {
        message: "Attendance alert sent".to_string(),
        sent: true,
    })
}

fn role_name(current: &CurrentUser) -> &'static str {
    match current.user {
        crate::models::SessionUser::Student { .. } => "student",
        crate::models::SessionUser::Faculty { .. } => "faculty",
        crate::models::SessionUser::Admin { .. } => "admin",
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsnQuery {
    usn: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonthlyQuery {
    usn: Option<String>,
    subject: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SemesterQuery {
    pub semester: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAttendance {
    #[serde(rename = "subjectCode")]
    subject_code: Option<String>,
    semester: Option<i32>,
    section: Option<String>,
    #[serde(default)]
    absentees: Vec<String>,
    date: Option<NaiveDate>,
    hours: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertRequest {
    usn: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceOverview {
    role: &'static str,
    usn: String,
    name: String,
    semester: i32,
    data: Vec<SubjectSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectListing {
    pub subjects: Vec<SubjectName>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyAttendance {
    subject: String,
    months: Vec<MonthlyPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceSaved {
    message: &'static str,
    present: usize,
    absent: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertOutcome {
    message: String,
    sent: bool,
}
