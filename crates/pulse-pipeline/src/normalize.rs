use chrono::{DateTime, NaiveDateTime, Utc};
use pulse_core::{
    iso_week_id, AndroidRecord, CanonicalReview, CleanCorpus, CleaningStats, IosRecord, Platform,
    RawCorpus, RawReview, Review, SnapshotManifest,
};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::dedup::{dedup_key, deduplicate};
use crate::error::MalformedReason;

/// Map one platform record onto the canonical schema.
///
/// Checks run in a fixed order (rating, timestamp, body) so every dropped
/// record is counted under exactly one reason.
pub fn normalize(raw: &RawReview) -> Result<CanonicalReview, MalformedReason> {
    let review = match raw {
        RawReview::Ios(record) => from_ios(record)?,
        RawReview::Android(record) => from_android(record)?,
    };
    let native_id = match raw {
        RawReview::Ios(r) => r.id.as_deref(),
        RawReview::Android(r) => r.review_id.as_deref(),
    };
    Ok(canonicalize(review, native_id))
}

fn from_ios(record: &IosRecord) -> Result<Review, MalformedReason> {
    let rating = parse_rating(record.rating.as_ref()).ok_or(MalformedReason::BadRating)?;
    let timestamp = record
        .updated
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or(MalformedReason::BadTimestamp)?;
    let text = non_empty(record.content.as_deref()).ok_or(MalformedReason::EmptyText)?;
    Ok(Review {
        source: Platform::Ios,
        review_id: non_empty(record.id.as_deref()).unwrap_or_default(),
        author: non_empty(record.author.as_deref()),
        rating,
        title: non_empty(record.title.as_deref()),
        text,
        timestamp,
        app_version: non_empty(record.version.as_deref()),
        region: non_empty(record.region.as_deref()).map(|r| r.to_lowercase()),
    })
}

fn from_android(record: &AndroidRecord) -> Result<Review, MalformedReason> {
    let rating = parse_rating(record.score.as_ref()).ok_or(MalformedReason::BadRating)?;
    let timestamp = record
        .at
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or(MalformedReason::BadTimestamp)?;
    let text = non_empty(record.content.as_deref()).ok_or(MalformedReason::EmptyText)?;
    Ok(Review {
        source: Platform::Android,
        review_id: non_empty(record.review_id.as_deref()).unwrap_or_default(),
        author: non_empty(record.user_name.as_deref()),
        rating,
        title: None,
        text,
        timestamp,
        app_version: non_empty(record.app_version.as_deref()),
        region: non_empty(record.region.as_deref()).map(|r| r.to_lowercase()),
    })
}

fn canonicalize(mut review: Review, native_id: Option<&str>) -> CanonicalReview {
    let native_id = native_id.map(str::trim).filter(|id| !id.is_empty());
    let key = dedup_key(
        review.source,
        native_id,
        &review.text,
        review.timestamp,
        review.rating,
    );
    if review.review_id.is_empty() {
        review.review_id = format!("derived-{}", &key[..16]);
    }
    CanonicalReview {
        week_id: iso_week_id(review.timestamp),
        dedup_key: key,
        review,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Integer star rating in 1..=5. iOS sends the label as a string, Play as a number.
fn parse_rating(value: Option<&JsonValue>) -> Option<u8> {
    let rating = match value? {
        JsonValue::Number(n) => match n.as_u64() {
            Some(v) => v,
            None => {
                let f = n.as_f64()?;
                if f.fract() != 0.0 || f < 0.0 {
                    return None;
                }
                f as u64
            }
        },
        JsonValue::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    (1..=5).contains(&rating).then_some(rating as u8)
}

/// RFC 3339, or the naive `YYYY-MM-DD HH:MM:SS` form the Play scraper emits (UTC).
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Normalize, window-filter and deduplicate a raw corpus.
///
/// The snapshot manifest is left empty; the clean phase fills it after the
/// Parquet export.
pub fn clean_corpus(raw: &RawCorpus) -> CleanCorpus {
    let mut stats = CleaningStats {
        input_count: raw.records.len(),
        ..Default::default()
    };

    let mut normalized = Vec::with_capacity(raw.records.len());
    for record in &raw.records {
        match normalize(record) {
            Ok(review) => {
                if raw.window.contains(review.review.timestamp.date_naive()) {
                    normalized.push(review);
                } else {
                    stats.dropped_out_of_window += 1;
                }
            }
            Err(reason) => {
                match reason {
                    MalformedReason::BadRating => stats.dropped_bad_rating += 1,
                    MalformedReason::BadTimestamp => stats.dropped_bad_timestamp += 1,
                    MalformedReason::EmptyText => stats.dropped_empty_text += 1,
                }
                warn!(platform = %record.platform(), %reason, "dropping malformed record");
            }
        }
    }

    let before = normalized.len();
    let reviews = deduplicate(normalized);
    stats.dropped_duplicate = before - reviews.len();
    stats.output_count = reviews.len();
    for review in &reviews {
        *stats.platform_counts.entry(review.review.source).or_default() += 1;
        *stats.week_counts.entry(review.week_id.clone()).or_default() += 1;
    }

    info!(
        input = stats.input_count,
        output = stats.output_count,
        dropped = stats.dropped_total(),
        duplicates = stats.dropped_duplicate,
        bad_rating = stats.dropped_bad_rating,
        bad_timestamp = stats.dropped_bad_timestamp,
        empty_text = stats.dropped_empty_text,
        out_of_window = stats.dropped_out_of_window,
        "corpus cleaned"
    );
    CleanCorpus {
        reviews,
        stats,
        snapshot: SnapshotManifest::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use pulse_core::RunWindow;
    use serde_json::json;

    fn ios(id: &str, rating: JsonValue, content: &str, updated: &str) -> RawReview {
        RawReview::Ios(IosRecord {
            id: Some(id.into()),
            rating: Some(rating),
            title: Some("  Title ".into()),
            content: Some(content.into()),
            author: Some("Asha".into()),
            version: Some("5.2.1".into()),
            updated: Some(updated.into()),
            region: Some("IN".into()),
        })
    }

    fn android(id: Option<&str>, score: JsonValue, content: &str, at: &str) -> RawReview {
        RawReview::Android(AndroidRecord {
            review_id: id.map(Into::into),
            user_name: Some("Ravi".into()),
            content: Some(content.into()),
            score: Some(score),
            at: Some(at.into()),
            app_version: Some("5.2.0".into()),
            region: None,
        })
    }

    #[test]
    fn ios_records_map_onto_canonical_fields() {
        let review = normalize(&ios("11", json!("4"), " Fast payouts ", "2026-02-10T09:00:00-07:00"))
            .expect("normalizes");

        assert_eq!(review.review.source, Platform::Ios);
        assert_eq!(review.review.review_id, "11");
        assert_eq!(review.review.rating, 4);
        assert_eq!(review.review.text, "Fast payouts");
        assert_eq!(review.review.title.as_deref(), Some("Title"));
        assert_eq!(review.review.region.as_deref(), Some("in"));
        assert_eq!(
            review.review.timestamp,
            Utc.with_ymd_and_hms(2026, 2, 10, 16, 0, 0).single().unwrap()
        );
        assert_eq!(review.week_id, "2026-W07");
        assert_eq!(review.dedup_key.len(), 64);
    }

    #[test]
    fn android_naive_timestamps_are_utc() {
        let review = normalize(&android(Some("gp:1"), json!(2), "Login OTP never arrives", "2026-02-11 23:30:00"))
            .expect("normalizes");
        assert_eq!(review.review.source, Platform::Android);
        assert_eq!(review.review.author.as_deref(), Some("Ravi"));
        assert_eq!(review.review.app_version.as_deref(), Some("5.2.0"));
        assert_eq!(
            review.review.timestamp,
            Utc.with_ymd_and_hms(2026, 2, 11, 23, 30, 0).single().unwrap()
        );
    }

    #[test]
    fn malformed_records_report_their_reason() {
        assert_eq!(
            normalize(&ios("1", json!("6"), "x", "2026-02-10T09:00:00Z")),
            Err(MalformedReason::BadRating)
        );
        assert_eq!(
            normalize(&android(Some("a"), json!(3.5), "x", "2026-02-10 09:00:00")),
            Err(MalformedReason::BadRating)
        );
        assert_eq!(
            normalize(&ios("1", json!("3"), "x", "last tuesday")),
            Err(MalformedReason::BadTimestamp)
        );
        assert_eq!(
            normalize(&android(Some("a"), json!(5), "   ", "2026-02-10 09:00:00")),
            Err(MalformedReason::EmptyText)
        );
    }

    #[test]
    fn missing_native_ids_get_a_derived_id() {
        let review = normalize(&android(None, json!(5), "Great", "2026-02-10 09:00:00")).unwrap();
        assert!(review.review.review_id.starts_with("derived-"));
        assert_eq!(review.review.review_id.len(), "derived-".len() + 16);
    }

    #[test]
    fn clean_corpus_counts_every_drop() {
        let raw = RawCorpus {
            window: RunWindow {
                date_from: NaiveDate::from_ymd_opt(2026, 2, 9).unwrap(),
                date_to: NaiveDate::from_ymd_opt(2026, 2, 15).unwrap(),
            },
            records: vec![
                ios("1", json!("5"), "Love it", "2026-02-10T09:00:00Z"),
                ios("1", json!("5"), "Love it (edited)", "2026-02-10T10:00:00Z"),
                ios("2", json!("0"), "bad", "2026-02-10T09:00:00Z"),
                android(Some("gp:1"), json!(1), "Crash", "2026-02-01 09:00:00"),
                android(Some("gp:2"), json!(1), "", "2026-02-12 09:00:00"),
                android(Some("gp:3"), json!(1), "Crash on open", "2026-02-12 09:00:00"),
                ios("3", json!("4"), "Nice", "last tuesday"),
            ],
            source_counts: Default::default(),
            source_errors: vec![],
        };

        let clean = clean_corpus(&raw);

        assert_eq!(clean.stats.input_count, 7);
        assert_eq!(clean.stats.output_count, 2);
        assert_eq!(clean.stats.dropped_duplicate, 1);
        assert_eq!(clean.stats.dropped_bad_rating, 1);
        assert_eq!(clean.stats.dropped_bad_timestamp, 1);
        assert_eq!(clean.stats.dropped_out_of_window, 1);
        assert_eq!(clean.stats.dropped_empty_text, 1);
        assert_eq!(clean.stats.dropped_total(), 5);
        assert_eq!(clean.reviews[0].review.text, "Love it");
        assert_eq!(clean.stats.platform_counts[&Platform::Android], 1);
        assert_eq!(clean.stats.week_counts["2026-W07"], 2);
    }
}
