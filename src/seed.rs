use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use crate::auth::hash_password;
use crate::models::Subject;

/// Reads a JSON array of records; a missing file yields `None`.
pub async fn read_seed_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<Vec<T>>> {
    if !path.exists() {
        return Ok(None);
    }
    if !path.is_file() {
        bail!("Seed path {} is not a file", path.display());
    }
    let mut bytes = Vec::new();
    BufReader::new(File::open(path).await?)
        .read_to_end(&mut bytes)
        .await?;
    let records = serde_json::from_slice(&bytes)
        .with_context(|| format!("Malformed seed file {}", path.display()))?;
    Ok(Some(records))
}

fn hashed(password: &str) -> anyhow::Result<String> {
    hash_password(password).map_err(|err| anyhow!("Could not hash seed password: {:?}", err))
}

/// Phone numbers show up as both strings and numbers in seed files.
fn loose_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
pub struct SeedStudent {
    usn: String,
    name: String,
    email: String,
    password: String,
    section: String,
    sem: i32,
    phone: Option<Value>,
    join_year: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct SeedFaculty {
    ssn_id: String,
    name: String,
    email: String,
    password: String,
    phone: Option<Value>,
    position: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedAdmin {
    username: String,
    password: String,
}

/// Inserts every record not already present; existing rows are left alone.
pub async fn seed_from_dir(pg: &PgPool, dir: &str) -> anyhow::Result<()> {
    let dir = PathBuf::from(dir);
    let mut inserted = 0u64;

    if let Some(students) = read_seed_file::<SeedStudent>(&dir.join("student.json")).await? {
        for s in students {
            let res = sqlx::query(
                "INSERT INTO students (usn, name, email, password_hash, section, semester, phone, join_year)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (usn) DO NOTHING",
            )
            .bind(s.usn.trim())
            .bind(&s.name)
            .bind(s.email.trim())
            .bind(hashed(&s.password)?)
            .bind(s.section.trim())
            .bind(s.sem)
            .bind(loose_text(s.phone))
            .bind(s.join_year)
            .execute(pg)
            .await
            .with_context(|| format!("Seeding student {}", s.usn))?;
            inserted += res.rows_affected();
        }
    }

    if let Some(faculty) = read_seed_file::<SeedFaculty>(&dir.join("faculty.json")).await? {
        for f in faculty {
            let res = sqlx::query(
                "INSERT INTO faculty (ssn_id, name, email, password_hash, phone, position)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (ssn_id) DO NOTHING",
            )
            .bind(f.ssn_id.trim())
            .bind(&f.name)
            .bind(f.email.trim())
            .bind(hashed(&f.password)?)
            .bind(loose_text(f.phone))
            .bind(&f.position)
            .execute(pg)
            .await
            .with_context(|| format!("Seeding faculty {}", f.ssn_id))?;
            inserted += res.rows_affected();
        }
    }

    if let Some(admins) = read_seed_file::<SeedAdmin>(&dir.join("admin.json")).await? {
        for a in admins {
            let res = sqlx::query(
                "INSERT INTO admins (username, password_hash) VALUES ($1, $2)
                 ON CONFLICT (username) DO NOTHING",
            )
            .bind(a.username.trim())
            .bind(hashed(&a.password)?)
            .execute(pg)
            .await
            .with_context(|| format!("Seeding admin {}", a.username))?;
            inserted += res.rows_affected();
        }
    }

    if let Some(subjects) = read_seed_file::<Subject>(&dir.join("subjects.json")).await? {
        for subject in subjects {
            let res = sqlx::query(
                "INSERT INTO subjects (subject_code, subject_name, semester, department, credit, course_type)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (subject_code) DO NOTHING",
            )
            .bind(subject.subject_code.trim())
            .bind(&subject.subject_name)
            .bind(subject.semester)
            .bind(&subject.department)
            .bind(subject.credit)
            .bind(&subject.course_type)
            .execute(pg)
            .await
            .with_context(|| format!("Seeding subject {}", subject.subject_code))?;
            inserted += res.rows_affected();
        }
    }

    log::info!("Seeded {} new rows from {}", inserted, dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("seed-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn missing_seed_file_is_skipped() {
        let dir = scratch_dir("missing");
        let read = read_seed_file::<SeedAdmin>(&dir.join("admin.json")).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn seed_records_are_parsed() {
        let dir = scratch_dir("students");
        let path = dir.join("student.json");
        std::fs::write(
            &path,
            r#"[{"usn":"1CS21001","name":"Asha","email":"asha@college.edu","password":"pw",
                 "section":"A","sem":5,"phone":9876543210,"join_year":2021}]"#,
        )
        .unwrap();
        let students = read_seed_file::<SeedStudent>(&path).await.unwrap().unwrap();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].sem, 5);
        assert_eq!(
            loose_text(students[0].phone.clone()).as_deref(),
            Some("9876543210")
        );
    }

    #[tokio::test]
    async fn malformed_seed_file_names_the_path() {
        let dir = scratch_dir("broken");
        let path = dir.join("faculty.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_seed_file::<SeedFaculty>(&path).await.unwrap_err();
        assert!(format!("{}", err).contains("faculty.json"));
    }
}
