use std::collections::BTreeMap;

use pulse_core::{BucketAllocation, BucketId, CanonicalReview, RatingBand, SampleSet};
use rand::seq::index;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::PipelineError;

pub const DEFAULT_TARGET_SIZE: usize = 120;
pub const DEFAULT_MIN_PER_BUCKET: usize = 3;

/// splitmix64; seeded per bucket so a selection never depends on how many
/// draws another bucket made.
struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64_internal(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E3779B97F4A7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

impl rand::RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64_internal() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u64_internal()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut offset = 0;
        while offset < dest.len() {
            let bytes = self.next_u64_internal().to_le_bytes();
            let copy_len = (dest.len() - offset).min(bytes.len());
            dest[offset..offset + copy_len].copy_from_slice(&bytes[..copy_len]);
            offset += copy_len;
        }
    }
}

/// First 8 bytes of `sha256(run_label ‖ 0x00 ‖ bucket_id)`, little endian.
pub fn bucket_seed(run_label: &str, bucket: &BucketId) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(run_label.as_bytes());
    hasher.update([0u8]);
    hasher.update(bucket.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

struct Cell {
    id: BucketId,
    members: Vec<usize>,
    floor: usize,
    exact: f64,
    share: usize,
}

impl Cell {
    fn size(&self) -> usize {
        self.members.len()
    }

    fn deficit(&self) -> f64 {
        self.exact - self.share as f64
    }
}

/// Select a bounded, stratified subset of the cleaned corpus.
///
/// Buckets are `(ISO week, rating band)`. Each bucket gets a share
/// proportional to its size, never below `min(min_per_bucket, size)` unless
/// the floors alone exceed `target`; in that case negative-band buckets keep
/// their floor longest. The result never exceeds `target`, and is exactly
/// `target` whenever the corpus is larger. Identical corpus and run label
/// always yield the identical sample.
pub fn stratified_sample(
    corpus: &[CanonicalReview],
    run_label: &str,
    target: usize,
    min_per_bucket: usize,
) -> Result<SampleSet, PipelineError> {
    if corpus.is_empty() {
        return Err(PipelineError::InsufficientData(
            "cleaned corpus has no reviews to sample".into(),
        ));
    }
    if target == 0 {
        return Err(PipelineError::InsufficientData(
            "sample target size is zero".into(),
        ));
    }

    let mut grouped: BTreeMap<BucketId, Vec<usize>> = BTreeMap::new();
    for (idx, review) in corpus.iter().enumerate() {
        grouped.entry(review.bucket()).or_default().push(idx);
    }

    let total = corpus.len();
    let mut cells: Vec<Cell> = grouped
        .into_iter()
        .map(|(id, members)| {
            let size = members.len();
            let exact = target as f64 * size as f64 / total as f64;
            let floor = min_per_bucket.min(size);
            let share = if total <= target {
                size
            } else {
                (exact.round() as usize).clamp(floor, size)
            };
            Cell {
                id,
                members,
                floor,
                exact,
                share,
            }
        })
        .collect();

    if total > target {
        rebalance(&mut cells, target);
    }

    let mut reviews = Vec::with_capacity(target.min(total));
    let mut allocations = Vec::with_capacity(cells.len());
    for cell in &cells {
        if cell.share >= cell.size() {
            reviews.extend(cell.members.iter().map(|&i| corpus[i].clone()));
        } else if cell.share > 0 {
            let mut rng = DeterministicRng::new(bucket_seed(run_label, &cell.id));
            let mut positions = index::sample(&mut rng, cell.size(), cell.share).into_vec();
            positions.sort_unstable();
            reviews.extend(positions.into_iter().map(|p| corpus[cell.members[p]].clone()));
        }
        allocations.push(BucketAllocation {
            bucket: cell.id.to_string(),
            available: cell.size(),
            selected: cell.share,
        });
        debug!(bucket = %cell.id, available = cell.size(), selected = cell.share, "bucket allocated");
    }

    Ok(SampleSet {
        target_size: target,
        min_per_bucket,
        corpus_size: total,
        allocations,
        reviews,
    })
}

fn rebalance(cells: &mut [Cell], target: usize) {
    let mut sum: usize = cells.iter().map(|c| c.share).sum();

    while sum > target {
        let above_floor = cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.share > c.floor)
            .max_by(|(_, a), (_, b)| {
                a.share
                    .cmp(&b.share)
                    .then(a.size().cmp(&b.size()))
                    .then(b.id.cmp(&a.id))
            })
            .map(|(i, _)| i);
        // Floors alone exceed the target: give up non-negative floors first.
        let pick = above_floor.or_else(|| {
            cells
                .iter()
                .enumerate()
                .filter(|(_, c)| c.share > 0)
                .max_by(|(_, a), (_, b)| {
                    let a_spare = a.id.band != RatingBand::Negative;
                    let b_spare = b.id.band != RatingBand::Negative;
                    a_spare
                        .cmp(&b_spare)
                        .then(a.share.cmp(&b.share))
                        .then(b.id.cmp(&a.id))
                })
                .map(|(i, _)| i)
        });
        let Some(i) = pick else { break };
        cells[i].share -= 1;
        sum -= 1;
    }

    while sum < target {
        let pick = cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.share < c.size())
            .max_by(|(_, a), (_, b)| {
                a.deficit()
                    .total_cmp(&b.deficit())
                    .then(a.size().cmp(&b.size()))
                    .then(b.id.cmp(&a.id))
            })
            .map(|(i, _)| i);
        let Some(i) = pick else { break };
        cells[i].share += 1;
        sum += 1;
    }
}
