use std::fmt::Display;
use std::fs::read_to_string;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use log::{info, warn};

const MAX_DAYS: i64 = 365;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub db_max_connections: u32,
    pub mail: MailConfig,
    pub session_days: i64,
    pub cookie_secure: bool,
    pub cors_origins: Vec<String>,
    pub attendance_threshold: f64,
    pub alert_cooldown_days: i64,
    pub seed_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub from_email: String,
    pub from_name: String,
    pub contact_inbox: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        if dotenvy::dotenv().is_ok() {
            info!("Loaded variables from .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| read_secret(key)))
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host: String = try_load(&lookup, "BIND_ADDR", "0.0.0.0")?;
        let port: u16 = try_load(&lookup, "PORT", "3000")?;
        let bind_addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL is not configured"))?;

        let from_email: String = try_load(&lookup, "FROM_EMAIL", "no-reply@localhost")?;
        let contact_inbox = lookup("TO_EMAIL").unwrap_or_else(|| from_email.clone());
        let api_key = lookup("SENDGRID_API_KEY").filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!("SENDGRID_API_KEY not set, outgoing mail will only be logged");
        }

        let threshold: f64 = try_load(&lookup, "ATTENDANCE_THRESHOLD", "75")?;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(anyhow!(
                "ATTENDANCE_THRESHOLD must be within 0..=100, got {}",
                threshold
            ));
        }

        let session_days: i64 = try_load(&lookup, "SESSION_DAYS", "7")?;
        if !(1..=MAX_DAYS).contains(&session_days) {
            return Err(anyhow!(
                "SESSION_DAYS must be within 1..={}, got {}",
                MAX_DAYS,
                session_days
            ));
        }
        let alert_cooldown_days: i64 = try_load(&lookup, "ALERT_COOLDOWN_DAYS", "15")?;
        if !(0..=MAX_DAYS).contains(&alert_cooldown_days) {
            return Err(anyhow!(
                "ALERT_COOLDOWN_DAYS must be within 0..={}, got {}",
                MAX_DAYS,
                alert_cooldown_days
            ));
        }

        Ok(Self {
            bind_addr,
            database_url,
            db_max_connections: try_load(&lookup, "DB_MAX_CONNECTIONS", "10")?,
            mail: MailConfig {
                api_key,
                api_base: try_load(&lookup, "SENDGRID_API_BASE", "https://api.sendgrid.com")?,
                from_email,
                from_name: try_load(&lookup, "FROM_NAME", "CSE Department")?,
                contact_inbox,
            },
            session_days,
            cookie_secure: try_load(&lookup, "COOKIE_SECURE", "false")?,
            cors_origins: try_load::<String, _>(&lookup, "CORS_ORIGINS", "http://localhost:3000")?
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            attendance_threshold: threshold,
            alert_cooldown_days,
            seed_dir: lookup("SEED_DIR"),
        })
    }
}

fn try_load<T, F>(lookup: &F, key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.trim()
        .parse()
        .map_err(|e| anyhow!("Invalid {key} value `{raw}`: {e}"))
}

fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");
    read_to_string(&path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_is_set() {
        let config =
            Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://localhost/dept")]))
                .unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.session_days, 7);
        assert_eq!(config.attendance_threshold, 75.0);
        assert_eq!(config.alert_cooldown_days, 15);
        assert!(config.mail.api_key.is_none());
        assert_eq!(config.mail.contact_inbox, config.mail.from_email);
        assert_eq!(config.cors_origins, vec!["http://localhost:3000".to_string()]);
    }

    #[test]
    fn database_url_is_required() {
        assert!(Config::from_lookup(lookup_from(&[])).is_err());
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/dept"),
            ("PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        assert!(Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/dept"),
            ("ATTENDANCE_THRESHOLD", "140"),
        ]))
        .is_err());
    }

    #[test]
    fn day_counts_out_of_range_are_rejected() {
        for (key, value) in [
            ("SESSION_DAYS", "0"),
            ("SESSION_DAYS", "-3"),
            ("SESSION_DAYS", "1000000000000000"),
            ("ALERT_COOLDOWN_DAYS", "-1"),
            ("ALERT_COOLDOWN_DAYS", "1000000000000000"),
        ] {
            let err = Config::from_lookup(lookup_from(&[
                ("DATABASE_URL", "postgres://localhost/dept"),
                (key, value),
            ]))
            .unwrap_err();
            assert!(err.to_string().contains(key), "{}={}", key, value);
        }
    }

    #[test]
    fn day_counts_at_bounds_are_accepted() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/dept"),
            ("SESSION_DAYS", "365"),
            ("ALERT_COOLDOWN_DAYS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.session_days, 365);
        assert_eq!(config.alert_cooldown_days, 0);
    }

    #[test]
    fn origins_are_split_and_trimmed() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/dept"),
            ("CORS_ORIGINS", "http://a.test, https://b.test ,"),
            ("SENDGRID_API_KEY", "SG.key"),
        ]))
        .unwrap();
        assert_eq!(config.cors_origins, vec!["http://a.test", "https://b.test"]);
        assert_eq!(config.mail.api_key.as_deref(), Some("SG.key"));
    }
}
