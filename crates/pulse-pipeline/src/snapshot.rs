use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pulse_core::{CanonicalReview, PhaseName, SnapshotFile, SnapshotManifest, ARTIFACT_SCHEMA_VERSION};
use pulse_storage::{ArtifactStore, StoredArtifact};

pub const REVIEWS_PARQUET: &str = "reviews_clean.parquet";
pub const SNAPSHOT_MANIFEST: &str = "snapshot_manifest.json";

fn write_parquet(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

pub fn reviews_parquet_bytes(reviews: &[CanonicalReview]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("dedup_key", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("review_id", DataType::Utf8, false),
        ArrowField::new("rating", DataType::UInt32, false),
        ArrowField::new("week_id", DataType::Utf8, false),
        ArrowField::new("band", DataType::Utf8, false),
        ArrowField::new("timestamp", DataType::Utf8, false),
        ArrowField::new("text", DataType::Utf8, false),
        ArrowField::new("app_version", DataType::Utf8, true),
        ArrowField::new("region", DataType::Utf8, true),
    ]));

    let dedup_keys = StringArray::from(reviews.iter().map(|r| r.dedup_key.as_str()).collect::<Vec<_>>());
    let sources = StringArray::from(reviews.iter().map(|r| r.review.source.as_str()).collect::<Vec<_>>());
    let review_ids =
        StringArray::from(reviews.iter().map(|r| r.review.review_id.as_str()).collect::<Vec<_>>());
    let ratings = UInt32Array::from(reviews.iter().map(|r| u32::from(r.review.rating)).collect::<Vec<_>>());
    let weeks = StringArray::from(reviews.iter().map(|r| r.week_id.as_str()).collect::<Vec<_>>());
    let bands = StringArray::from(reviews.iter().map(|r| r.band().as_str()).collect::<Vec<_>>());
    let timestamps = StringArray::from(
        reviews
            .iter()
            .map(|r| r.review.timestamp.to_rfc3339())
            .collect::<Vec<_>>(),
    );
    let texts = StringArray::from(reviews.iter().map(|r| r.review.text.as_str()).collect::<Vec<_>>());
    let versions = StringArray::from(
        reviews
            .iter()
            .map(|r| r.review.app_version.as_deref())
            .collect::<Vec<_>>(),
    );
    let regions = StringArray::from(
        reviews
            .iter()
            .map(|r| r.review.region.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dedup_keys),
            Arc::new(sources),
            Arc::new(review_ids),
            Arc::new(ratings),
            Arc::new(weeks),
            Arc::new(bands),
            Arc::new(timestamps),
            Arc::new(texts),
            Arc::new(versions),
            Arc::new(regions),
        ],
    )
    .context("building reviews record batch")?;
    write_parquet(batch)
}

fn manifest_entry(name: &str, run_label: &str, stored: &StoredArtifact) -> SnapshotFile {
    let rel = stored
        .relative_path
        .strip_prefix(run_label)
        .unwrap_or(&stored.relative_path)
        .display()
        .to_string();
    SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: stored.content_hash.clone(),
        bytes: stored.byte_size as u64,
    }
}

/// Write the cleaned corpus as Parquet plus a sha256 manifest into the clean
/// phase directory.
pub async fn export_clean_snapshot(
    store: &ArtifactStore,
    run_label: &str,
    reviews: &[CanonicalReview],
) -> Result<SnapshotManifest> {
    let bytes = reviews_parquet_bytes(reviews)?;
    let stored = store
        .write_bytes(run_label, PhaseName::Clean, REVIEWS_PARQUET, &bytes)
        .await?;

    let manifest = SnapshotManifest {
        schema_version: ARTIFACT_SCHEMA_VERSION,
        files: vec![manifest_entry("reviews_clean", run_label, &stored)],
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    store
        .write_bytes(run_label, PhaseName::Clean, SNAPSHOT_MANIFEST, &manifest_bytes)
        .await?;
    Ok(manifest)
}
