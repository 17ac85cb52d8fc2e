use std::path::{Path, PathBuf};

use anyhow::Context;
use pulse_core::RegistryEntry;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Append-only JSON Lines log of completed runs (`history/registry.jsonl`).
///
/// Entries are never rewritten; a forced re-archive appends a newer line and
/// readers take the last entry per run label.
#[derive(Debug, Clone)]
pub struct RunRegistry {
    path: PathBuf,
}

impl RunRegistry {
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        Self {
            path: data_root.as_ref().join("history").join("registry.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &RegistryEntry) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_vec(entry).context("serializing registry entry")?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", self.path.display()))?;

        info!(run_label = %entry.run_label, health_score = entry.health_score, "run registered");
        Ok(())
    }

    pub async fn entries(&self) -> anyhow::Result<Vec<RegistryEntry>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?
        {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("parsing {} line {}", self.path.display(), idx + 1)
                })
            })
            .collect()
    }

    pub async fn latest(&self) -> anyhow::Result<Option<RegistryEntry>> {
        Ok(self.entries().await?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn entry(label: &str, score: u8) -> RegistryEntry {
        RegistryEntry {
            run_label: label.to_string(),
            completed_at: Utc.with_ymd_and_hms(2026, 2, 16, 6, 0, 0).single().unwrap(),
            health_score: score,
            health_label: "Stable".into(),
            top_theme_ids: vec!["login-issues".into()],
            clean_review_count: 42,
            email_sent: false,
        }
    }

    #[tokio::test]
    async fn appends_preserve_earlier_entries_byte_for_byte() {
        let dir = tempdir().expect("tempdir");
        let registry = RunRegistry::new(dir.path());

        registry.append(&entry("2026-W06", 71)).await.unwrap();
        let before = std::fs::read(registry.path()).unwrap();
        registry.append(&entry("2026-W07", 64)).await.unwrap();
        let after = std::fs::read(registry.path()).unwrap();

        assert!(after.starts_with(&before));
        let entries = registry.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].run_label, "2026-W06");
        assert_eq!(registry.latest().await.unwrap().unwrap().run_label, "2026-W07");
    }

    #[tokio::test]
    async fn missing_registry_reads_empty() {
        let dir = tempdir().expect("tempdir");
        let registry = RunRegistry::new(dir.path());
        assert!(registry.entries().await.unwrap().is_empty());
        assert!(registry.latest().await.unwrap().is_none());
    }
}
