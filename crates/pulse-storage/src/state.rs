use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use pulse_core::{PhaseName, PhaseStatus, RunWindow, ARTIFACT_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::write_atomic;

const STATE_FILE_NAME: &str = "run_state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    pub output_path: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Durable per-run record of phase completion, one file per run label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub run_label: String,
    pub window: Option<RunWindow>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phases: BTreeMap<PhaseName, PhaseRecord>,
}

impl RunState {
    fn new(run_label: &str) -> Self {
        let now = Utc::now();
        Self {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            run_label: run_label.to_string(),
            window: None,
            created_at: now,
            updated_at: now,
            phases: BTreeMap::new(),
        }
    }

    pub fn record(&self, phase: PhaseName) -> PhaseRecord {
        self.phases.get(&phase).cloned().unwrap_or_default()
    }

    pub fn status(&self, phase: PhaseName) -> PhaseStatus {
        self.phases
            .get(&phase)
            .map(|r| r.status)
            .unwrap_or(PhaseStatus::Pending)
    }

    pub fn all_done(&self, phases: &[PhaseName]) -> bool {
        phases.iter().all(|p| self.status(*p) == PhaseStatus::Done)
    }
}

/// File-backed phase state. Every mutation rewrites the run's state file
/// atomically, so a crash never leaves a phase falsely marked done.
///
/// Single writer per run label; concurrent invocations for the same label
/// may lose updates.
#[derive(Debug, Clone)]
pub struct PhaseStateStore {
    root: PathBuf,
}

impl PhaseStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn state_path(&self, run_label: &str) -> PathBuf {
        self.root.join(run_label).join(STATE_FILE_NAME)
    }

    /// Load the run's state, or a fresh pending state if none is persisted yet.
    pub async fn load(&self, run_label: &str) -> anyhow::Result<RunState> {
        let path = self.state_path(run_label);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(RunState::new(run_label));
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let state: RunState =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if state.schema_version != ARTIFACT_SCHEMA_VERSION {
            bail!(
                "run state {} has schema version {}, expected {}",
                path.display(),
                state.schema_version,
                ARTIFACT_SCHEMA_VERSION
            );
        }
        if state.run_label != run_label {
            bail!(
                "run state {} belongs to `{}`, not `{}`",
                path.display(),
                state.run_label,
                run_label
            );
        }
        Ok(state)
    }

    pub async fn get(&self, run_label: &str, phase: PhaseName) -> anyhow::Result<PhaseStatus> {
        Ok(self.load(run_label).await?.status(phase))
    }

    /// Create the state file on first use and pin the run's ingestion window.
    pub async fn init_run(&self, run_label: &str, window: RunWindow) -> anyhow::Result<RunState> {
        let mut state = self.load(run_label).await?;
        if state.window.is_none() {
            state.window = Some(window);
            self.save(&mut state).await?;
        }
        Ok(state)
    }

    pub async fn mark_done(
        &self,
        run_label: &str,
        phase: PhaseName,
        output_path: &str,
    ) -> anyhow::Result<()> {
        self.update(run_label, phase, |record| {
            record.status = PhaseStatus::Done;
            record.output_path = Some(output_path.to_string());
            record.completed_at = Some(Utc::now());
            record.error = None;
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        run_label: &str,
        phase: PhaseName,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.update(run_label, phase, |record| {
            record.status = PhaseStatus::Failed;
            record.output_path = None;
            record.completed_at = Some(Utc::now());
            record.error = Some(reason.to_string());
        })
        .await
    }

    /// Return a phase to pending. The only mutation a forced re-run performs
    /// before executing.
    pub async fn clear(&self, run_label: &str, phase: PhaseName) -> anyhow::Result<()> {
        let mut state = self.load(run_label).await?;
        if state.phases.remove(&phase).is_some() {
            self.save(&mut state).await?;
        }
        Ok(())
    }

    async fn update(
        &self,
        run_label: &str,
        phase: PhaseName,
        apply: impl FnOnce(&mut PhaseRecord),
    ) -> anyhow::Result<()> {
        let mut state = self.load(run_label).await?;
        apply(state.phases.entry(phase).or_default());
        self.save(&mut state).await
    }

    async fn save(&self, state: &mut RunState) -> anyhow::Result<()> {
        state.updated_at = Utc::now();
        let path = self.state_path(&state.run_label);
        let bytes = serde_json::to_vec_pretty(state).context("serializing run state")?;
        write_atomic(&path, &bytes).await?;
        debug!(run_label = %state.run_label, path = %path.display(), "run state saved");
        Ok(())
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
    async fn unknown_runs_read_as_pending() {
        let dir = tempdir().expect("tempdir");
        let store = PhaseStateStore::new(dir.path());
        assert_eq!(
            store.get("2026-W07", PhaseName::Ingest).await.unwrap(),
            PhaseStatus::Pending
        );
        assert!(!store.state_path("2026-W07").exists());
    }

    #[tokio::test]
    async fn transitions_survive_a_fresh_store_instance() {
        let dir = tempdir().expect("tempdir");
        let store = PhaseStateStore::new(dir.path());
        store.init_run("2026-W07", window()).await.unwrap();
        store
            .mark_done("2026-W07", PhaseName::Ingest, "2026-W07/01-raw/raw_corpus.json")
            .await
            .unwrap();
        store
            .mark_failed("2026-W07", PhaseName::Clean, "disk full")
            .await
            .unwrap();

        let reopened = PhaseStateStore::new(dir.path());
        let state = reopened.load("2026-W07").await.unwrap();
        assert_eq!(state.window, Some(window()));
        assert_eq!(state.status(PhaseName::Ingest), PhaseStatus::Done);
        assert_eq!(
            state.record(PhaseName::Ingest).output_path.as_deref(),
            Some("2026-W07/01-raw/raw_corpus.json")
        );
        assert_eq!(state.status(PhaseName::Clean), PhaseStatus::Failed);
        assert_eq!(state.record(PhaseName::Clean).error.as_deref(), Some("disk full"));
        assert_eq!(state.status(PhaseName::Sample), PhaseStatus::Pending);
    }

    #[tokio::test]
    async fn clear_resets_only_the_named_phase() {
        let dir = tempdir().expect("tempdir");
        let store = PhaseStateStore::new(dir.path());
        store.mark_done("run-a", PhaseName::Ingest, "a").await.unwrap();
        store.mark_done("run-a", PhaseName::Clean, "b").await.unwrap();

        store.clear("run-a", PhaseName::Clean).await.unwrap();

        assert_eq!(store.get("run-a", PhaseName::Ingest).await.unwrap(), PhaseStatus::Done);
        assert_eq!(store.get("run-a", PhaseName::Clean).await.unwrap(), PhaseStatus::Pending);
    }

    #[tokio::test]
    async fn init_run_keeps_the_first_window() {
        let dir = tempdir().expect("tempdir");
        let store = PhaseStateStore::new(dir.path());
        store.init_run("run-a", window()).await.unwrap();
        let other = RunWindow {
            date_from: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            date_to: NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
        };
        let state = store.init_run("run-a", other).await.unwrap();
        assert_eq!(state.window, Some(window()));
    }

    #[tokio::test]
    async fn state_files_for_other_labels_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = PhaseStateStore::new(dir.path());
        store.mark_done("run-a", PhaseName::Ingest, "a").await.unwrap();
        std::fs::create_dir_all(dir.path().join("run-b")).unwrap();
        std::fs::copy(store.state_path("run-a"), store.state_path("run-b")).unwrap();

        assert!(store.load("run-b").await.is_err());
    }
}
