use std::collections::HashSet;

use chrono::{DateTime, Utc};
use pulse_core::{normalize_text_fragment, CanonicalReview, Platform};
use sha2::{Digest, Sha256};

/// Derived identity of a review.
///
/// Native platform ids win when present; otherwise the key falls back to the
/// normalized body, the UTC calendar day and the rating, so cosmetic edits
/// (case, punctuation, spacing) and intra-day re-posts collapse together.
pub fn dedup_key(
    source: Platform,
    native_id: Option<&str>,
    text: &str,
    timestamp: DateTime<Utc>,
    rating: u8,
) -> String {
    let material = match native_id {
        Some(id) => format!("native|{}|{}", source.as_str(), id),
        None => format!(
            "content|{}|{}|{}",
            normalize_text_fragment(text),
            timestamp.format("%Y-%m-%d"),
            rating
        ),
    };
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

/// Order-preserving, first-seen-wins removal of repeated dedup keys.
pub fn deduplicate(reviews: impl IntoIterator<Item = CanonicalReview>) -> Vec<CanonicalReview> {
    let mut seen = HashSet::new();
    reviews
        .into_iter()
        .filter(|review| seen.insert(review.dedup_key.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_core::{iso_week_id, Review};

    fn review(source: Platform, id: Option<&str>, text: &str, hour: u32, rating: u8) -> CanonicalReview {
        let timestamp = Utc.with_ymd_and_hms(2026, 2, 10, hour, 0, 0).single().unwrap();
        CanonicalReview {
            dedup_key: dedup_key(source, id, text, timestamp, rating),
            week_id: iso_week_id(timestamp),
            review: Review {
                source,
                review_id: id.unwrap_or("derived").to_string(),
                author: None,
                rating,
                title: None,
                text: text.to_string(),
                timestamp,
                app_version: None,
                region: None,
            },
        }
    }

    #[test]
    fn same_source_and_id_collapse_to_the_first() {
        let out = deduplicate(vec![
            review(Platform::Ios, Some("42"), "first", 9, 5),
            review(Platform::Ios, Some("42"), "second", 11, 4),
            review(Platform::Android, Some("42"), "other store", 9, 5),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].review.text, "first");
        assert_eq!(out[1].review.source, Platform::Android);
    }

    #[test]
    fn content_keys_ignore_case_punctuation_and_time_of_day() {
        let a = review(Platform::Android, None, "App crashes on LOGIN!!", 8, 1);
        let b = review(Platform::Android, None, "app crashes on login", 20, 1);
        let c = review(Platform::Android, None, "app crashes on login", 20, 2);
        assert_eq!(a.dedup_key, b.dedup_key);
        assert_ne!(a.dedup_key, c.dedup_key);
    }

    #[test]
    fn dedup_is_idempotent_and_never_grows() {
        let input = vec![
            review(Platform::Ios, Some("1"), "a", 9, 5),
            review(Platform::Ios, Some("2"), "b", 9, 4),
            review(Platform::Ios, Some("1"), "a", 9, 5),
            review(Platform::Android, None, "c", 9, 3),
            review(Platform::Android, None, "C.", 10, 3),
        ];
        let once = deduplicate(input.clone());
        let twice = deduplicate(once.clone());

        assert!(once.len() <= input.len());
        assert_eq!(once.len(), 3);
        assert_eq!(once, twice);
        let keys: HashSet<_> = once.iter().map(|r| &r.dedup_key).collect();
        assert_eq!(keys.len(), once.len());
    }
}
