use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Result, VigilError};

/// Source of "now" for both engines. Tests drive time through a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Saturates at `chrono::Duration::MAX`.
pub fn minutes(m: u64) -> chrono::Duration {
    i64::try_from(m)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .unwrap_or(chrono::Duration::MAX)
}

/// `at` plus `m` minutes, clamped to the latest representable instant.
pub fn after_minutes(at: DateTime<Utc>, m: u64) -> DateTime<Utc> {
    at.checked_add_signed(minutes(m))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at` minus `d`, clamped to the earliest representable instant.
pub fn before(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn parse_time_or_relative(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    if let Ok(duration) = humantime::parse_duration(input) {
        return Ok(before(Utc::now(), duration));
    }

    Err(VigilError::Parse(format!(
        "expected RFC3339 time or duration, got {input}"
    )))
}

pub fn parse_duration_str(input: &str) -> Result<Duration> {
    humantime::parse_duration(input)
        .map_err(|e| VigilError::Parse(format!("invalid duration {input}: {e}")))
}
