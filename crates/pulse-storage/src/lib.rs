//! Run-scoped artifact storage, phase state, and run history for the pulse pipeline.

use std::path::{Path, PathBuf};

use anyhow::Context;
use pulse_core::{ArtifactEnvelope, PhaseName};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod registry;
mod state;

pub use registry::RunRegistry;
pub use state::{PhaseRecord, PhaseStateStore, RunState};

pub const CRATE_NAME: &str = "pulse-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    /// Path relative to the data root, as recorded in run state.
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
///
/// Readers observe either the previous content or the new content, never a
/// truncated file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Per-run directory tree: `<root>/<run_label>/<NN-phase>/<file>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_label: &str) -> PathBuf {
        self.root.join(run_label)
    }

    pub fn phase_relative_path(&self, run_label: &str, phase: PhaseName, file_name: &str) -> PathBuf {
        PathBuf::from(run_label).join(phase.dir_name()).join(file_name)
    }

    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub async fn write_bytes(
        &self,
        run_label: &str,
        phase: PhaseName,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let relative_path = self.phase_relative_path(run_label, phase, file_name);
        let absolute_path = self.root.join(&relative_path);
        write_atomic(&absolute_path, bytes).await?;
        Ok(StoredArtifact {
            content_hash: sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    /// Persist a phase's envelope under its canonical artifact file name.
    pub async fn write_envelope<T: Serialize>(
        &self,
        envelope: &ArtifactEnvelope<T>,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(envelope)
            .with_context(|| format!("serializing {} artifact", envelope.phase))?;
        self.write_bytes(
            &envelope.run_label,
            envelope.phase,
            envelope.phase.artifact_file_name(),
            &bytes,
        )
        .await
    }

    pub async fn read_envelope<T: DeserializeOwned>(
        &self,
        relative: impl AsRef<Path>,
    ) -> anyhow::Result<ArtifactEnvelope<T>> {
        let path = self.root.join(relative.as_ref());
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
