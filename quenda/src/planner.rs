//! Computes the next eligible run instant for repeating jobs.
//!
//! Two repeat styles exist and they drift differently on purpose:
//!
//! - **cron** — slots are fixed points on a timezone-aware calendar. The
//!   worker commits the next slot *before* running the handler, so execution
//!   time does not push the schedule (no drift). Missed slots are skipped by
//!   the caller, never backfilled.
//! - **every** — the next run is planned relative to the instant the current
//!   one finished, so the schedule drifts with execution time.
//!
//! Cron expressions are the standard 5-field dialect; a leading seconds field
//! (6 fields) is accepted for sub-minute schedules. Timezones are IANA names
//! evaluated DST-aware.

use std::borrow::Cow;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest interval an `every` repeat may use, in milliseconds. Prevents a
/// busy loop when `every` is 0.
pub const MIN_INTERVAL_MS: i64 = 100;

/// A job's repeat specification as persisted on the record.
///
/// `cron` and `every` are mutually exclusive; `every` is in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<i64>,
    /// IANA timezone for cron evaluation; falls back to the worker default,
    /// then UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl RepeatSpec {
    pub fn every(ms: i64) -> Self {
        Self {
            every: Some(ms),
            ..Default::default()
        }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Self {
            cron: Some(expr.into()),
            ..Default::default()
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("unknown IANA timezone {0:?}")]
    UnknownTimezone(String),
    #[error("cron schedule has no upcoming slot")]
    NoUpcomingSlot,
    #[error("repeat spec has neither cron nor every")]
    Unplannable,
}

/// Returns the next run instant strictly after `base`.
///
/// For `every` this is `base + max(every, 100ms)`; for `cron` it is the first
/// calendar slot after `base` in the spec's timezone (or `default_timezone`).
/// The caller is responsible for iterating past missed slots.
pub fn next_run_at(
    spec: &RepeatSpec,
    base: DateTime<Utc>,
    default_timezone: Tz,
) -> Result<DateTime<Utc>, PlanError> {
    if let Some(every) = spec.every {
        let step = TimeDelta::milliseconds(every.max(MIN_INTERVAL_MS));
        return Ok(base + step);
    }
    if let Some(expr) = &spec.cron {
        let schedule = parse_cron(expr)?;
        let tz = resolve_timezone(spec.timezone.as_deref(), default_timezone)?;
        return schedule
            .after(&base.with_timezone(&tz))
            .map(|slot| slot.with_timezone(&Utc))
            .find(|slot| *slot > base)
            .ok_or(PlanError::NoUpcomingSlot);
    }
    Err(PlanError::Unplannable)
}

/// Parses a cron expression, accepting both the 5-field standard dialect and
/// the 6-field leading-seconds extension.
pub fn parse_cron(expr: &str) -> Result<Schedule, PlanError> {
    let normalized = normalize_cron(expr);
    Schedule::from_str(&normalized).map_err(|source| PlanError::InvalidCron {
        expr: expr.to_owned(),
        source,
    })
}

// The cron crate wants a seconds field; standard 5-field expressions get one
// pinned to the top of the minute.
fn normalize_cron(expr: &str) -> Cow<'_, str> {
    match expr.split_whitespace().count() {
        5 => Cow::Owned(format!("0 {}", expr.trim())),
        _ => Cow::Borrowed(expr),
    }
}

pub fn resolve_timezone(timezone: Option<&str>, default: Tz) -> Result<Tz, PlanError> {
    match timezone {
        None => Ok(default),
        Some(name) => name
            .parse()
            .map_err(|_| PlanError::UnknownTimezone(name.to_owned())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn at(iso: &str) -> DateTime<Utc> {
        iso.parse().unwrap()
    }

    #[test]
    fn interval_adds_every_to_base() {
        let base = at("2024-03-01T12:00:00Z");
        let spec = RepeatSpec::every(30_000);
        assert_eq!(
            next_run_at(&spec, base, Tz::UTC).unwrap(),
            base + TimeDelta::seconds(30)
        );
    }

    #[test]
    fn interval_floors_at_min_interval() {
        let base = at("2024-03-01T12:00:00Z");
        for every in [0, 1, 99] {
            let next = next_run_at(&RepeatSpec::every(every), base, Tz::UTC).unwrap();
            assert_eq!(next, base + TimeDelta::milliseconds(MIN_INTERVAL_MS));
        }
        // The floor is a minimum, not a quantum.
        let next = next_run_at(&RepeatSpec::every(101), base, Tz::UTC).unwrap();
        assert_eq!(next, base + TimeDelta::milliseconds(101));
    }

    #[test]
    fn interval_result_is_at_least_base_plus_floor() {
        let base = Utc::now();
        let next = next_run_at(&RepeatSpec::every(0), base, Tz::UTC).unwrap();
        assert!(next >= base + TimeDelta::milliseconds(MIN_INTERVAL_MS));
    }

    #[test]
    fn cron_five_field_finds_next_minute_slot() {
        let base = at("2024-03-01T12:00:30Z");
        let spec = RepeatSpec::cron("*/5 * * * *");
        assert_eq!(
            next_run_at(&spec, base, Tz::UTC).unwrap(),
            at("2024-03-01T12:05:00Z")
        );
    }

    #[test]
    fn cron_six_field_supports_sub_minute_slots() {
        let base = at("2024-03-01T12:00:00.500Z");
        let spec = RepeatSpec::cron("*/1 * * * * *");
        assert_eq!(
            next_run_at(&spec, base, Tz::UTC).unwrap(),
            at("2024-03-01T12:00:01Z")
        );
    }

    #[test]
    fn cron_slot_is_strictly_after_base() {
        // Base sitting exactly on a slot must yield the following one.
        let base = at("2024-03-01T12:05:00Z");
        let spec = RepeatSpec::cron("*/5 * * * *");
        let next = next_run_at(&spec, base, Tz::UTC).unwrap();
        assert!(next > base);
        assert_eq!(next, at("2024-03-01T12:10:00Z"));
    }

    #[test]
    fn cron_honors_spec_timezone_over_default() {
        // 02:30 New York is 07:30 UTC in winter.
        let base = at("2024-01-15T00:00:00Z");
        let spec = RepeatSpec::cron("30 2 * * *").with_timezone("America/New_York");
        assert_eq!(
            next_run_at(&spec, base, Tz::Asia__Tokyo).unwrap(),
            at("2024-01-15T07:30:00Z")
        );
    }

    #[test]
    fn cron_falls_back_to_default_timezone() {
        let base = at("2024-01-15T00:00:00Z");
        let spec = RepeatSpec::cron("30 2 * * *");
        assert_eq!(
            next_run_at(&spec, base, Tz::America__New_York).unwrap(),
            at("2024-01-15T07:30:00Z")
        );
    }

    #[test]
    fn cron_is_dst_aware() {
        // US spring forward 2024-03-10: noon local moves from 17:00 UTC to
        // 16:00 UTC, so successive daily slots are 23 hours apart.
        let base = at("2024-03-09T00:00:00Z");
        let spec = RepeatSpec::cron("0 12 * * *").with_timezone("America/New_York");

        let first = next_run_at(&spec, base, Tz::UTC).unwrap();
        let second = next_run_at(&spec, first, Tz::UTC).unwrap();

        assert_eq!(first, at("2024-03-09T17:00:00Z"), "noon EST");
        assert_eq!(second, at("2024-03-10T16:00:00Z"), "noon EDT");
        assert_eq!(second - first, TimeDelta::hours(23));
    }

    #[test]
    fn empty_spec_is_unplannable() {
        let err = next_run_at(&RepeatSpec::default(), Utc::now(), Tz::UTC).unwrap_err();
        assert_matches!(err, PlanError::Unplannable);
    }

    #[test]
    fn bad_cron_and_timezone_are_rejected() {
        assert_matches!(
            next_run_at(&RepeatSpec::cron("61 * * * *"), Utc::now(), Tz::UTC),
            Err(PlanError::InvalidCron { .. })
        );
        assert_matches!(
            next_run_at(
                &RepeatSpec::cron("* * * * *").with_timezone("Nowhere/Special"),
                Utc::now(),
                Tz::UTC
            ),
            Err(PlanError::UnknownTimezone(_))
        );
    }
}
