use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monday_of_iso_week;

/// Days of history a custom (non-week) label covers when no lookback is given.
const CUSTOM_LABEL_WINDOW_DAYS: i64 = 90;

/// Inclusive ingestion window, in UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

impl RunWindow {
    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.date_from && day <= self.date_to
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTarget {
    pub run_label: String,
    pub window: RunWindow,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunLabelError {
    #[error("week label `{0}` is not a valid ISO week (expected YYYY-WNN with NN in 1..=53)")]
    InvalidWeek(String),
    #[error("run label `{0}` must be YYYY-WNN or contain only letters, digits, `-` and `_`")]
    InvalidLabel(String),
    #[error("lookback must be at least one week")]
    ZeroLookback,
    #[error("lookback of {0} weeks reaches past the supported calendar range")]
    LookbackTooLarge(u32),
}

/// Resolve the run label and ingestion window from operator input.
///
/// `lookback_weeks` wins over the label's own window; the label then only
/// names the run (defaulting to `historical-{n}w`).
pub fn resolve_run(
    label: Option<&str>,
    lookback_weeks: Option<u32>,
    today: NaiveDate,
) -> Result<RunTarget, RunLabelError> {
    if let Some(n) = lookback_weeks {
        if n == 0 {
            return Err(RunLabelError::ZeroLookback);
        }
        let run_label = match label {
            Some(raw) => parse_label(raw, today)?.run_label,
            None => format!("historical-{n}w"),
        };
        let date_from = Duration::try_weeks(i64::from(n))
            .and_then(|span| today.checked_sub_signed(span))
            .ok_or(RunLabelError::LookbackTooLarge(n))?;
        return Ok(RunTarget {
            run_label,
            window: RunWindow {
                date_from,
                date_to: today,
            },
        });
    }

    match label {
        Some(raw) => parse_label(raw, today),
        None => Ok(previous_iso_week(today)),
    }
}

fn parse_label(raw: &str, today: NaiveDate) -> Result<RunTarget, RunLabelError> {
    let trimmed = raw.trim();
    if let Some((year, week)) = split_week_label(trimmed) {
        let monday = monday_of_iso_week(year, week)
            .ok_or_else(|| RunLabelError::InvalidWeek(trimmed.to_string()))?;
        return Ok(RunTarget {
            run_label: format!("{year}-W{week:02}"),
            window: RunWindow {
                date_from: monday,
                date_to: monday + Duration::days(6),
            },
        });
    }

    if looks_like_week(trimmed) {
        return Err(RunLabelError::InvalidWeek(trimmed.to_string()));
    }

    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(RunLabelError::InvalidLabel(raw.to_string()));
    }
    Ok(RunTarget {
        run_label: trimmed.to_string(),
        window: RunWindow {
            date_from: today - Duration::days(CUSTOM_LABEL_WINDOW_DAYS),
            date_to: today,
        },
    })
}

fn split_week_label(label: &str) -> Option<(i32, u32)> {
    let upper = label.to_ascii_uppercase();
    let (year, week) = upper.split_once("-W")?;
    if year.len() != 4 || week.len() != 2 {
        return None;
    }
    if !year.chars().all(|c| c.is_ascii_digit()) || !week.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((year.parse().ok()?, week.parse().ok()?))
}

/// `YYYY-W<digits>` with the wrong number of week digits, e.g. `2026-W7`.
fn looks_like_week(label: &str) -> bool {
    let upper = label.to_ascii_uppercase();
    match upper.split_once("-W") {
        Some((year, week)) => {
            year.len() == 4
                && year.chars().all(|c| c.is_ascii_digit())
                && !week.is_empty()
                && week.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn previous_iso_week(today: NaiveDate) -> RunTarget {
    let last_week = (today - Duration::days(7)).iso_week();
    let monday = monday_of_iso_week(last_week.year(), last_week.week())
        .unwrap_or(today - Duration::days(7));
    RunTarget {
        run_label: format!("{}-W{:02}", last_week.year(), last_week.week()),
        window: RunWindow {
            date_from: monday,
            date_to: monday + Duration::days(6),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn explicit_week_resolves_monday_to_sunday() {
        let target = resolve_run(Some("2026-w07"), None, day(2026, 10, 16)).unwrap();
        assert_eq!(target.run_label, "2026-W07");
        assert_eq!(target.window.date_from, day(2026, 2, 9));
        assert_eq!(target.window.date_to, day(2026, 2, 15));
    }

    #[test]
    fn week_54_is_rejected() {
        let err = resolve_run(Some("2026-W54"), None, day(2026, 10, 16)).unwrap_err();
        assert_eq!(err, RunLabelError::InvalidWeek("2026-W54".into()));
    }

    #[test]
    fn missing_label_means_last_week() {
        // 2026-10-16 is a Friday in W42.
        let target = resolve_run(None, None, day(2026, 10, 16)).unwrap();
        assert_eq!(target.run_label, "2026-W41");
        assert_eq!(target.window.date_from, day(2026, 10, 5));
        assert_eq!(target.window.date_to, day(2026, 10, 11));
    }

    #[test]
    fn lookback_names_a_historical_run() {
        let target = resolve_run(None, Some(12), day(2026, 10, 16)).unwrap();
        assert_eq!(target.run_label, "historical-12w");
        assert_eq!(target.window.date_from, day(2026, 7, 24));
        assert!(target.window.contains(day(2026, 10, 16)));
    }

    #[test]
    fn custom_labels_are_restricted_to_path_safe_characters() {
        assert!(resolve_run(Some("q3-review_01"), None, day(2026, 10, 16)).is_ok());
        assert!(matches!(
            resolve_run(Some("../etc"), None, day(2026, 10, 16)),
            Err(RunLabelError::InvalidLabel(_))
        ));
        assert_eq!(
            resolve_run(None, Some(0), day(2026, 10, 16)),
            Err(RunLabelError::ZeroLookback)
        );
    }

    #[test]
    fn lookback_beyond_the_calendar_is_an_error_not_a_panic() {
        assert_eq!(
            resolve_run(None, Some(u32::MAX), day(2026, 10, 16)),
            Err(RunLabelError::LookbackTooLarge(u32::MAX))
        );
        assert!(resolve_run(None, Some(52 * 100), day(2026, 10, 16)).is_ok());
    }

    #[test]
    fn malformed_week_digits_are_not_custom_labels() {
        for label in ["2026-W7", "2026-w007"] {
            assert_eq!(
                resolve_run(Some(label), None, day(2026, 10, 16)),
                Err(RunLabelError::InvalidWeek(label.into())),
                "{label}"
            );
        }
        assert!(resolve_run(Some("2026-Wrap"), None, day(2026, 10, 16)).is_ok());
    }
}
