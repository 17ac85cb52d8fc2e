//! Core domain model and artifact contracts for the review pulse pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod run;

pub use run::{resolve_run, RunLabelError, RunTarget, RunWindow};

pub const CRATE_NAME: &str = "pulse-core";

/// Version stamped into every persisted artifact envelope and run state file.
pub const ARTIFACT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// App Store RSS entry as captured by the iOS scraping collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IosRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "im:rating", default)]
    pub rating: Option<JsonValue>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(rename = "im:version", default)]
    pub version: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Play Store review as captured by the Android scraping collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AndroidRecord {
    #[serde(rename = "reviewId", default)]
    pub review_id: Option<String>,
    #[serde(rename = "userName", default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub score: Option<JsonValue>,
    #[serde(default)]
    pub at: Option<String>,
    #[serde(rename = "appVersion", default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Raw platform record handed from a scraping collaborator to the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawReview {
    Ios(IosRecord),
    Android(AndroidRecord),
}

impl RawReview {
    pub fn platform(&self) -> Platform {
        match self {
            RawReview::Ios(_) => Platform::Ios,
            RawReview::Android(_) => Platform::Android,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub source: Platform,
    pub review_id: String,
    pub author: Option<String>,
    pub rating: u8,
    pub title: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub app_version: Option<String>,
    pub region: Option<String>,
}

/// A review after normalization, carrying its derived identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalReview {
    #[serde(flatten)]
    pub review: Review,
    pub dedup_key: String,
    pub week_id: String,
}

impl CanonicalReview {
    pub fn band(&self) -> RatingBand {
        RatingBand::from_rating(self.review.rating)
    }

    pub fn bucket(&self) -> BucketId {
        BucketId {
            week_id: self.week_id.clone(),
            band: self.band(),
        }
    }
}

/// ISO week label (`2026-W07`) for a UTC timestamp.
pub fn iso_week_id(timestamp: DateTime<Utc>) -> String {
    let week = timestamp.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatingBand {
    Negative,
    Neutral,
    Positive,
}

impl RatingBand {
    pub fn from_rating(rating: u8) -> Self {
        match rating {
            0..=2 => RatingBand::Negative,
            3 => RatingBand::Neutral,
            _ => RatingBand::Positive,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RatingBand::Negative => "negative",
            RatingBand::Neutral => "neutral",
            RatingBand::Positive => "positive",
        }
    }
}

/// Stratification cell: one calendar week crossed with one rating band.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketId {
    pub week_id: String,
    pub band: RatingBand,
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.week_id, self.band.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Ingest,
    Clean,
    Sample,
    Themes,
    Pulse,
    Actions,
    Insights,
    Report,
    Email,
    Archive,
}

impl PhaseName {
    pub const ALL: [PhaseName; 10] = [
        PhaseName::Ingest,
        PhaseName::Clean,
        PhaseName::Sample,
        PhaseName::Themes,
        PhaseName::Pulse,
        PhaseName::Actions,
        PhaseName::Insights,
        PhaseName::Report,
        PhaseName::Email,
        PhaseName::Archive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::Ingest => "ingest",
            PhaseName::Clean => "clean",
            PhaseName::Sample => "sample",
            PhaseName::Themes => "themes",
            PhaseName::Pulse => "pulse",
            PhaseName::Actions => "actions",
            PhaseName::Insights => "insights",
            PhaseName::Report => "report",
            PhaseName::Email => "email",
            PhaseName::Archive => "archive",
        }
    }

    /// Declared upstream edges; every listed phase must be `done` first.
    pub fn depends_on(self) -> &'static [PhaseName] {
        use PhaseName::*;
        match self {
            Ingest => &[],
            Clean => &[Ingest],
            Sample => &[Clean],
            Themes => &[Sample],
            Pulse => &[Clean, Themes],
            Actions => &[Themes, Pulse],
            Insights => &[Themes, Pulse, Actions],
            Report => &[Pulse, Insights],
            Email => &[Pulse, Insights, Report],
            Archive => &[Themes, Pulse, Email],
        }
    }

    /// Run-relative directory holding this phase's artifacts, e.g. `04-themes`.
    pub fn dir_name(self) -> String {
        let ordinal = PhaseName::ALL
            .iter()
            .position(|p| *p == self)
            .map(|i| i + 1)
            .unwrap_or(0);
        let label = match self {
            PhaseName::Ingest => "raw",
            other => other.as_str(),
        };
        format!("{ordinal:02}-{label}")
    }

    pub fn artifact_file_name(self) -> &'static str {
        match self {
            PhaseName::Ingest => "raw_corpus.json",
            PhaseName::Clean => "clean_corpus.json",
            PhaseName::Sample => "sample.json",
            PhaseName::Themes => "themes.json",
            PhaseName::Pulse => "pulse.json",
            PhaseName::Actions => "actions.json",
            PhaseName::Insights => "insights.json",
            PhaseName::Report => "report.json",
            PhaseName::Email => "send_receipt.json",
            PhaseName::Archive => "archive.json",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown phase `{0}`")]
pub struct UnknownPhase(pub String);

impl FromStr for PhaseName {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        PhaseName::ALL
            .into_iter()
            .find(|p| p.as_str() == needle)
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Done,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Done => "done",
            PhaseStatus::Failed => "failed",
        }
    }
}

/// Self-describing wrapper persisted around every phase payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnvelope<T> {
    pub schema_version: u32,
    pub phase: PhaseName,
    pub run_label: String,
    pub generated_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> ArtifactEnvelope<T> {
    pub fn new(phase: PhaseName, run_label: impl Into<String>, payload: T) -> Self {
        Self {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            phase,
            run_label: run_label.into(),
            generated_at: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCorpus {
    pub window: RunWindow,
    pub records: Vec<RawReview>,
    pub source_counts: BTreeMap<Platform, usize>,
    #[serde(default)]
    pub source_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CleaningStats {
    pub input_count: usize,
    pub output_count: usize,
    pub dropped_duplicate: usize,
    pub dropped_bad_rating: usize,
    pub dropped_bad_timestamp: usize,
    pub dropped_empty_text: usize,
    pub dropped_out_of_window: usize,
    pub platform_counts: BTreeMap<Platform, usize>,
    pub week_counts: BTreeMap<String, usize>,
}

impl CleaningStats {
    /// Records dropped for any reason; `input_count - output_count` once cleaning ends.
    pub fn dropped_total(&self) -> usize {
        self.dropped_duplicate
            + self.dropped_bad_rating
            + self.dropped_bad_timestamp
            + self.dropped_empty_text
            + self.dropped_out_of_window
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanCorpus {
    pub reviews: Vec<CanonicalReview>,
    pub stats: CleaningStats,
    #[serde(default)]
    pub snapshot: SnapshotManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAllocation {
    pub bucket: String,
    pub available: usize,
    pub selected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSet {
    pub target_size: usize,
    pub min_per_bucket: usize,
    pub corpus_size: usize,
    pub allocations: Vec<BucketAllocation>,
    pub reviews: Vec<CanonicalReview>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Mixed,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    #[serde(default)]
    pub theme_id: String,
    pub theme_name: String,
    pub description: String,
    pub sentiment: Sentiment,
    pub review_count: u32,
    pub avg_rating: f64,
    #[serde(default)]
    pub example_quotes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemesDoc {
    pub model: String,
    pub reviews_in_prompt: usize,
    pub total_reviews: usize,
    pub themes: Vec<Theme>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseDoc {
    pub model: String,
    pub health_score: u8,
    pub health_label: String,
    pub weighted_avg_rating: f64,
    pub total_reviews: u32,
    pub corpus_avg_rating: f64,
    pub rating_distribution: BTreeMap<u8, usize>,
    pub summary: String,
    pub top_positives: Vec<String>,
    pub top_negatives: Vec<String>,
    pub watch_list: Vec<String>,
    pub pm_note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub priority: Priority,
    pub category: String,
    pub title: String,
    pub description: String,
    pub theme_source: String,
    pub effort: String,
    pub expected_impact: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionsDoc {
    pub model: String,
    pub actions: Vec<ActionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightTheme {
    pub name: String,
    pub sentiment: Sentiment,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightAction {
    pub title: String,
    pub description: String,
    pub priority: Priority,
}

/// Curated top-3 executive briefing shared by the report and the email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightsDoc {
    pub model: String,
    pub top_themes: Vec<InsightTheme>,
    pub top_quotes: Vec<String>,
    pub top_actions: Vec<InsightAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDoc {
    pub html_path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub recipient: Option<String>,
    pub subject: String,
    pub sent: bool,
    pub reason: Option<String>,
    pub message_path: Option<String>,
}

/// Immutable history record appended once a run's final phase succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub run_label: String,
    pub completed_at: DateTime<Utc>,
    pub health_score: u8,
    pub health_label: String,
    pub top_theme_ids: Vec<String>,
    pub clean_review_count: usize,
    pub email_sent: bool,
}

/// Lowercase, alphanumeric-only, single-space form used for content identity.
pub fn normalize_text_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// URL-safe identifier derived from a theme name.
pub fn slugify(input: &str) -> String {
    normalize_text_fragment(input).replace(' ', "-")
}

pub(crate) fn monday_of_iso_week(year: i32, week: u32) -> Option<NaiveDate> {
    NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rating_bands_cover_the_scale() {
        assert_eq!(RatingBand::from_rating(1), RatingBand::Negative);
        assert_eq!(RatingBand::from_rating(2), RatingBand::Negative);
        assert_eq!(RatingBand::from_rating(3), RatingBand::Neutral);
        assert_eq!(RatingBand::from_rating(4), RatingBand::Positive);
        assert_eq!(RatingBand::from_rating(5), RatingBand::Positive);
    }

    #[test]
    fn iso_week_id_uses_iso_year() {
        let ts = Utc.with_ymd_and_hms(2027, 1, 1, 9, 0, 0).single().unwrap();
        assert_eq!(iso_week_id(ts), "2026-W53");
        let ts = Utc.with_ymd_and_hms(2026, 2, 13, 9, 0, 0).single().unwrap();
        assert_eq!(iso_week_id(ts), "2026-W07");
    }

    #[test]
    fn phase_edges_only_point_backwards() {
        for (idx, phase) in PhaseName::ALL.iter().enumerate() {
            for upstream in phase.depends_on() {
                let pos = PhaseName::ALL.iter().position(|p| p == upstream).unwrap();
                assert!(pos < idx, "{phase} depends on later phase {upstream}");
            }
        }
    }

    #[test]
    fn phase_dirs_are_ordinal_prefixed() {
        assert_eq!(PhaseName::Ingest.dir_name(), "01-raw");
        assert_eq!(PhaseName::Themes.dir_name(), "04-themes");
        assert_eq!(PhaseName::Archive.dir_name(), "10-archive");
    }

    #[test]
    fn phase_names_parse_case_insensitively() {
        assert_eq!("Themes".parse::<PhaseName>(), Ok(PhaseName::Themes));
        assert!("render".parse::<PhaseName>().is_err());
    }

    #[test]
    fn raw_review_is_externally_tagged() {
        let json = r#"{"android":{"reviewId":"gp:1","content":"ok","score":4,"at":"2026-02-10 08:00:00"}}"#;
        let raw: RawReview = serde_json::from_str(json).unwrap();
        assert_eq!(raw.platform(), Platform::Android);
        let back = serde_json::to_value(&raw).unwrap();
        assert!(back.get("android").is_some());
    }

    #[test]
    fn text_fragments_collapse_punctuation_and_case() {
        assert_eq!(normalize_text_fragment("  App CRASHES!!  on login... "), "app crashes on login");
        assert_eq!(slugify("Login & OTP Issues"), "login-otp-issues");
    }
}
