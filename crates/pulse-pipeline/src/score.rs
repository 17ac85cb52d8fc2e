use std::collections::BTreeMap;

use pulse_core::{CanonicalReview, Sentiment, Theme};

/// Negative themes above this share of themed reviews cost health points.
const DOMINANT_NEGATIVE_SHARE: f64 = 0.10;
const MAX_PENALTY_PER_THEME: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthScore {
    pub score: u8,
    pub label: &'static str,
    pub weighted_avg_rating: f64,
    pub total_reviews: u32,
}

pub fn health_label(score: u8) -> &'static str {
    match score {
        80.. => "Healthy",
        60..=79 => "Stable",
        40..=59 => "At Risk",
        _ => "Critical",
    }
}

/// Volume-weighted theme rating scaled to 0..=100, minus a penalty for each
/// dominant negative theme.
pub fn compute_health_score(themes: &[Theme]) -> HealthScore {
    let total_reviews: u32 = themes.iter().map(|t| t.review_count).sum();
    if total_reviews == 0 {
        return HealthScore {
            score: 0,
            label: health_label(0),
            weighted_avg_rating: 0.0,
            total_reviews: 0,
        };
    }

    let total = f64::from(total_reviews);
    let weighted_sum: f64 = themes
        .iter()
        .map(|t| t.avg_rating * f64::from(t.review_count))
        .sum();
    let weighted_avg = weighted_sum / total;

    let mut score = weighted_avg / 5.0 * 100.0;
    for theme in themes.iter().filter(|t| t.sentiment == Sentiment::Negative) {
        let share = f64::from(theme.review_count) / total;
        if share > DOMINANT_NEGATIVE_SHARE {
            score -= (share * 20.0).min(MAX_PENALTY_PER_THEME);
        }
    }
    let score = score.round().clamp(0.0, 100.0) as u8;

    HealthScore {
        score,
        label: health_label(score),
        weighted_avg_rating: (weighted_avg * 100.0).round() / 100.0,
        total_reviews,
    }
}

pub fn rating_distribution(reviews: &[CanonicalReview]) -> BTreeMap<u8, usize> {
    let mut distribution: BTreeMap<u8, usize> = (1..=5).map(|r| (r, 0)).collect();
    for review in reviews {
        *distribution.entry(review.review.rating).or_default() += 1;
    }
    distribution
}

pub fn average_rating(reviews: &[CanonicalReview]) -> f64 {
    if reviews.is_empty() {
        return 0.0;
    }
    let sum: u64 = reviews.iter().map(|r| u64::from(r.review.rating)).sum();
    let avg = sum as f64 / reviews.len() as f64;
    (avg * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn theme(sentiment: Sentiment, count: u32, avg: f64) -> Theme {
        Theme {
            theme_id: String::new(),
            theme_name: "t".into(),
            description: "d".into(),
            sentiment,
            review_count: count,
            avg_rating: avg,
            example_quotes: vec![],
        }
    }

    #[test]
    fn empty_themes_score_zero_and_critical() {
        let score = compute_health_score(&[]);
        assert_eq!(score.score, 0);
        assert_eq!(score.label, "Critical");
    }

    #[test]
    fn dominant_negative_themes_are_penalized() {
        // weighted avg = (4.5*60 + 1.5*40) / 100 = 3.3 -> 66; penalty min(5, 0.4*20) = 5.
        let score = compute_health_score(&[
            theme(Sentiment::Positive, 60, 4.5),
            theme(Sentiment::Negative, 40, 1.5),
        ]);
        assert_eq!(score.weighted_avg_rating, 3.3);
        assert_eq!(score.total_reviews, 100);
        assert_eq!(score.score, 61);
        assert_eq!(score.label, "Stable");
    }

    #[test]
    fn small_negative_themes_are_not_penalized() {
        let score = compute_health_score(&[
            theme(Sentiment::Positive, 95, 5.0),
            theme(Sentiment::Negative, 5, 1.0),
        ]);
        // (475 + 5) / 100 = 4.8 -> 96
        assert_eq!(score.score, 96);
        assert_eq!(score.label, "Healthy");
    }

    #[test]
    fn label_thresholds() {
        assert_eq!(health_label(100), "Healthy");
        assert_eq!(health_label(80), "Healthy");
        assert_eq!(health_label(79), "Stable");
        assert_eq!(health_label(40), "At Risk");
        assert_eq!(health_label(39), "Critical");
    }
}
