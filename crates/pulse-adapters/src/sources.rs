use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{AndroidRecord, IosRecord, Platform, RawReview, RunWindow};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{AdapterError, ReviewSource};

/// Captured scraper export: one platform, records in scrape order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub platform: Platform,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub captured_from_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<JsonValue>,
}

/// Review source backed by a captured scraper export on disk.
#[derive(Debug, Clone)]
pub struct FixtureReviewSource {
    platform: Platform,
    path: PathBuf,
    app_id: Option<String>,
}

impl FixtureReviewSource {
    pub fn new(platform: Platform, path: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            path: path.into(),
            app_id: None,
        }
    }

    /// Only accept bundles captured for this store id (App Store id or
    /// Play package). Bundles that carry no id are accepted.
    pub fn with_app_id(mut self, app_id: Option<String>) -> Self {
        self.app_id = app_id;
        self
    }
}

fn to_raw_review(platform: Platform, value: JsonValue) -> serde_json::Result<RawReview> {
    Ok(match platform {
        Platform::Ios => RawReview::Ios(serde_json::from_value::<IosRecord>(value)?),
        Platform::Android => RawReview::Android(serde_json::from_value::<AndroidRecord>(value)?),
    })
}

#[async_trait]
impl ReviewSource for FixtureReviewSource {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch(&self, window: &RunWindow) -> Result<Vec<RawReview>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let bundle: FixtureBundle = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        if bundle.platform != self.platform {
            return Err(AdapterError::Message(format!(
                "{} holds {} records, expected {}",
                self.path.display(),
                bundle.platform,
                self.platform
            )));
        }
        if let (Some(expected), Some(found)) = (&self.app_id, &bundle.app_id) {
            if expected != found {
                return Err(AdapterError::Message(format!(
                    "{} was captured for app {found}, expected {expected}",
                    self.path.display()
                )));
            }
        }

        let mut out = Vec::with_capacity(bundle.records.len());
        let mut unreadable = 0usize;
        for value in bundle.records {
            match to_raw_review(self.platform, value) {
                Ok(raw) => out.push(raw),
                Err(err) => {
                    unreadable += 1;
                    warn!(platform = %self.platform, error = %err, "skipping unreadable fixture record");
                }
            }
        }
        info!(
            platform = %self.platform,
            records = out.len(),
            unreadable,
            from = %window.date_from,
            to = %window.date_to,
            "fixture source loaded"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn window() -> RunWindow {
        RunWindow {
            date_from: NaiveDate::from_ymd_opt(2026, 2, 9).unwrap(),
            date_to: NaiveDate::from_ymd_opt(2026, 2, 15).unwrap(),
        }
    }

    #[tokio::test]
    async fn ios_bundle_records_become_tagged_raw_reviews() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ios.json");
        std::fs::write(
            &path,
            r#"{
              "platform": "ios",
              "app_id": "1450178837",
              "fetched_at": "2026-02-16T06:00:00Z",
              "records": [
                {"id": "11", "im:rating": "1", "content": "Crashes on login", "updated": "2026-02-10T09:00:00-07:00"},
                {"id": "12", "im:rating": "5", "content": "Love it", "updated": "2026-02-11T09:00:00-07:00"},
                {"id": "13", "im:rating": "4", "content": 7}
              ]
            }"#,
        )
        .unwrap();

        let source = FixtureReviewSource::new(Platform::Ios, &path);
        let records = source.fetch(&window()).await.expect("fetch");

        assert_eq!(records.len(), 2);
        match &records[0] {
            RawReview::Ios(r) => {
                assert_eq!(r.id.as_deref(), Some("11"));
                assert_eq!(r.content.as_deref(), Some("Crashes on login"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn platform_mismatch_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("android.json");
        std::fs::write(
            &path,
            r#"{"platform": "android", "fetched_at": "2026-02-16T06:00:00Z", "records": []}"#,
        )
        .unwrap();

        let source = FixtureReviewSource::new(Platform::Ios, &path);
        assert!(matches!(
            source.fetch(&window()).await,
            Err(AdapterError::Message(_))
        ));
    }

    #[tokio::test]
    async fn bundle_for_another_app_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("android.json");
        std::fs::write(
            &path,
            r#"{"platform": "android", "app_id": "com.other.app", "fetched_at": "2026-02-16T06:00:00Z", "records": []}"#,
        )
        .unwrap();

        let pinned = FixtureReviewSource::new(Platform::Android, &path)
            .with_app_id(Some("com.nextbillion.groww".into()));
        match pinned.fetch(&window()).await {
            Err(AdapterError::Message(msg)) => {
                assert!(msg.contains("com.other.app"), "{msg}");
                assert!(msg.contains("com.nextbillion.groww"), "{msg}");
            }
            other => panic!("expected app mismatch, got {other:?}"),
        }

        let matching = FixtureReviewSource::new(Platform::Android, &path)
            .with_app_id(Some("com.other.app".into()));
        assert!(matching.fetch(&window()).await.unwrap().is_empty());
        let unpinned = FixtureReviewSource::new(Platform::Android, &path);
        assert!(unpinned.fetch(&window()).await.is_ok());
    }
}
