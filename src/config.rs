use std::env;
use std::path::PathBuf;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub session_ttl_hours: i64,
    pub db_max_connections: u32,
    pub run_migrations: bool,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub clinic_tz_offset_minutes: i32,
}

const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let upload_dir = env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./uploads"));

        Ok(Self {
            database_url,
            bind_addr,
            session_ttl_hours: parse_var("SESSION_TTL_HOURS", 24)?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 10)?,
            run_migrations: parse_var("RUN_MIGRATIONS", true)?,
            upload_dir,
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            clinic_tz_offset_minutes: parse_var("CLINIC_TIMEZONE_OFFSET_MINUTES", 0)?,
        })
    }
}

/// Unset falls back to `default`; a set but unparsable value is an error.
fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trimmed_numbers() {
        let v: i64 = parse_value("SESSION_TTL_HOURS", " 48 ").unwrap();
        assert_eq!(v, 48);
    }

    #[test]
    fn rejects_garbage_instead_of_defaulting() {
        let err = parse_value::<u32>("DB_MAX_CONNECTIONS", "ten").unwrap_err();
        assert!(err.to_string().contains("DB_MAX_CONNECTIONS"));
    }

    #[test]
    fn parses_booleans() {
        assert!(!parse_value::<bool>("RUN_MIGRATIONS", "false").unwrap());
    }
}
