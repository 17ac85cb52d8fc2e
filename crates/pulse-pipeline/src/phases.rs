//! The ten pipeline phases. Each reads its upstream artifacts through the
//! run state, calls at most one collaborator, and persists one envelope.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use pulse_adapters::{EmailMessage, LlmClient, Mailer, ReviewSource};
use pulse_core::{
    ActionsDoc, ArtifactEnvelope, CleanCorpus, InsightsDoc, PhaseName, PulseDoc, RawCorpus,
    RegistryEntry, ReportDoc, RunWindow, SampleSet, SendReceipt, ThemesDoc, ARTIFACT_SCHEMA_VERSION,
};
use pulse_storage::{ArtifactStore, RunRegistry, RunState, StoredArtifact};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::normalize::clean_corpus;
use crate::parse::parse_llm_json;
use crate::prompts::{
    actions_prompt, insights_prompt, pulse_prompt, themes_prompt, ActionsReply, InsightsReply,
    PromptTuning, PulseNarrative, ThemesReply,
};
use crate::render::{render_email, render_report};
use crate::sample::stratified_sample;
use crate::score::{average_rating, compute_health_score, rating_distribution};
use crate::snapshot::export_clean_snapshot;

pub const REPORT_HTML: &str = "report.html";
pub const EMAIL_HTML: &str = "email.html";
pub const EMAIL_TEXT: &str = "email.txt";
pub const DRAFT_ONLY_REASON: &str = "draft-only";
pub const NO_RECIPIENT_REASON: &str = "no recipient configured";

/// Everything a phase may read while executing.
pub struct PhaseContext<'a> {
    pub phase: PhaseName,
    pub run_label: &'a str,
    pub window: RunWindow,
    pub store: &'a ArtifactStore,
    pub state: &'a RunState,
}

impl PhaseContext<'_> {
    /// Payload of a completed upstream phase, located through the run state.
    pub async fn load<T: DeserializeOwned>(&self, upstream: PhaseName) -> Result<T, PipelineError> {
        let path = self
            .state
            .record(upstream)
            .output_path
            .ok_or(PipelineError::MissingDependency {
                phase: self.phase,
                upstream,
            })?;
        let envelope: ArtifactEnvelope<T> = self.store.read_envelope(&path).await?;
        if envelope.schema_version != ARTIFACT_SCHEMA_VERSION || envelope.run_label != self.run_label {
            return Err(PipelineError::Storage(anyhow!(
                "{path} is schema v{} for `{}`, expected v{} for `{}`",
                envelope.schema_version,
                envelope.run_label,
                ARTIFACT_SCHEMA_VERSION,
                self.run_label
            )));
        }
        Ok(envelope.payload)
    }

    pub async fn persist<T: Serialize>(&self, payload: T) -> Result<StoredArtifact, PipelineError> {
        let envelope = ArtifactEnvelope::new(self.phase, self.run_label, payload);
        Ok(self.store.write_envelope(&envelope).await?)
    }

    pub async fn write_side_file(&self, file_name: &str, bytes: &[u8]) -> Result<StoredArtifact, PipelineError> {
        Ok(self
            .store
            .write_bytes(self.run_label, self.phase, file_name, bytes)
            .await?)
    }
}

#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> PhaseName;

    /// Run the phase and persist its envelope. Must not touch run state.
    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError>;
}

/// External collaborators the phases call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub sources: Vec<Arc<dyn ReviewSource>>,
    pub llm: Arc<dyn LlmClient>,
    pub mailer: Arc<dyn Mailer>,
}

#[derive(Debug, Clone)]
pub struct PhaseSettings {
    pub app_name: String,
    pub target_size: usize,
    pub min_per_bucket: usize,
    pub tuning: PromptTuning,
    pub sender: String,
    pub recipient: Option<String>,
    pub draft_only: bool,
}

impl PhaseSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            app_name: config.app.name.clone(),
            target_size: config.sampling.target_size,
            min_per_bucket: config.sampling.min_per_bucket,
            tuning: config.prompt_tuning(),
            sender: config.email.sender.clone(),
            recipient: config.email.recipient.clone(),
            draft_only: config.email.draft_only,
        }
    }
}

/// The full phase set in dependency order.
pub fn standard_phases(
    settings: PhaseSettings,
    collaborators: Collaborators,
    registry: RunRegistry,
) -> Vec<Box<dyn Phase>> {
    let Collaborators {
        sources,
        llm,
        mailer,
    } = collaborators;
    vec![
        Box::new(IngestPhase { sources }),
        Box::new(CleanPhase),
        Box::new(SamplePhase {
            target_size: settings.target_size,
            min_per_bucket: settings.min_per_bucket,
        }),
        Box::new(ThemesPhase {
            llm: llm.clone(),
            tuning: settings.tuning,
        }),
        Box::new(PulsePhase {
            llm: llm.clone(),
            tuning: settings.tuning,
        }),
        Box::new(ActionsPhase {
            llm: llm.clone(),
            tuning: settings.tuning,
        }),
        Box::new(InsightsPhase {
            llm,
            tuning: settings.tuning,
        }),
        Box::new(ReportPhase {
            app_name: settings.app_name.clone(),
        }),
        Box::new(EmailPhase {
            mailer,
            app_name: settings.app_name,
            sender: settings.sender,
            recipient: settings.recipient,
            draft_only: settings.draft_only,
        }),
        Box::new(ArchivePhase { registry }),
    ]
}

pub struct IngestPhase {
    sources: Vec<Arc<dyn ReviewSource>>,
}

#[async_trait]
impl Phase for IngestPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Ingest
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let mut records = Vec::new();
        let mut source_counts = BTreeMap::new();
        let mut source_errors = Vec::new();

        for source in &self.sources {
            let platform = source.platform();
            match source.fetch(&ctx.window).await {
                Ok(batch) => {
                    info!(%platform, records = batch.len(), "source fetched");
                    *source_counts.entry(platform).or_insert(0) += batch.len();
                    records.extend(batch);
                }
                Err(err) => {
                    warn!(%platform, error = %err, "source fetch failed");
                    source_errors.push(format!("{platform}: {err}"));
                }
            }
        }
        if !self.sources.is_empty() && source_errors.len() == self.sources.len() {
            return Err(PipelineError::external(
                PhaseName::Ingest,
                source_errors.join("; "),
            ));
        }

        ctx.persist(RawCorpus {
            window: ctx.window,
            records,
            source_counts,
            source_errors,
        })
        .await
    }
}

pub struct CleanPhase;

#[async_trait]
impl Phase for CleanPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Clean
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let raw: RawCorpus = ctx.load(PhaseName::Ingest).await?;
        let mut corpus = clean_corpus(&raw);
        corpus.snapshot = export_clean_snapshot(ctx.store, ctx.run_label, &corpus.reviews).await?;
        ctx.persist(corpus).await
    }
}

pub struct SamplePhase {
    target_size: usize,
    min_per_bucket: usize,
}

#[async_trait]
impl Phase for SamplePhase {
    fn name(&self) -> PhaseName {
        PhaseName::Sample
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let corpus: CleanCorpus = ctx.load(PhaseName::Clean).await?;
        let sample = stratified_sample(
            &corpus.reviews,
            ctx.run_label,
            self.target_size,
            self.min_per_bucket,
        )?;
        info!(
            selected = sample.reviews.len(),
            corpus = sample.corpus_size,
            buckets = sample.allocations.len(),
            "sample drawn"
        );
        ctx.persist(sample).await
    }
}

async fn call_llm(
    llm: &dyn LlmClient,
    phase: PhaseName,
    prompt: &pulse_adapters::ChatPrompt,
) -> Result<String, PipelineError> {
    info!(%phase, model = llm.model(), "calling llm");
    llm.complete(prompt)
        .await
        .map_err(|err| PipelineError::external(phase, err))
}

pub struct ThemesPhase {
    llm: Arc<dyn LlmClient>,
    tuning: PromptTuning,
}

#[async_trait]
impl Phase for ThemesPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Themes
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let sample: SampleSet = ctx.load(PhaseName::Sample).await?;
        if sample.reviews.is_empty() {
            return Err(PipelineError::InsufficientData("sample is empty".into()));
        }
        let prompt = themes_prompt(&sample, self.tuning);
        let raw = call_llm(self.llm.as_ref(), PhaseName::Themes, &prompt).await?;
        let themes = parse_llm_json::<ThemesReply>(PhaseName::Themes, &raw)?.validate()?;
        ctx.persist(ThemesDoc {
            model: self.llm.model().to_string(),
            reviews_in_prompt: sample.reviews.len(),
            total_reviews: sample.corpus_size,
            themes,
        })
        .await
    }
}

pub struct PulsePhase {
    llm: Arc<dyn LlmClient>,
    tuning: PromptTuning,
}

#[async_trait]
impl Phase for PulsePhase {
    fn name(&self) -> PhaseName {
        PhaseName::Pulse
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let corpus: CleanCorpus = ctx.load(PhaseName::Clean).await?;
        let themes: ThemesDoc = ctx.load(PhaseName::Themes).await?;
        let score = compute_health_score(&themes.themes);

        let prompt = pulse_prompt(ctx.run_label, &themes, &score, self.tuning);
        let raw = call_llm(self.llm.as_ref(), PhaseName::Pulse, &prompt).await?;
        let narrative = parse_llm_json::<PulseNarrative>(PhaseName::Pulse, &raw)?.validate()?;

        ctx.persist(PulseDoc {
            model: self.llm.model().to_string(),
            health_score: score.score,
            health_label: score.label.to_string(),
            weighted_avg_rating: score.weighted_avg_rating,
            total_reviews: score.total_reviews,
            corpus_avg_rating: average_rating(&corpus.reviews),
            rating_distribution: rating_distribution(&corpus.reviews),
            summary: narrative.summary,
            top_positives: narrative.top_positives,
            top_negatives: narrative.top_negatives,
            watch_list: narrative.watch_list,
            pm_note: narrative.pm_note,
        })
        .await
    }
}

pub struct ActionsPhase {
    llm: Arc<dyn LlmClient>,
    tuning: PromptTuning,
}

#[async_trait]
impl Phase for ActionsPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Actions
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let themes: ThemesDoc = ctx.load(PhaseName::Themes).await?;
        let pulse: PulseDoc = ctx.load(PhaseName::Pulse).await?;

        let prompt = actions_prompt(ctx.run_label, &pulse, &themes, self.tuning);
        let raw = call_llm(self.llm.as_ref(), PhaseName::Actions, &prompt).await?;
        let actions = parse_llm_json::<ActionsReply>(PhaseName::Actions, &raw)?.validate()?;
        ctx.persist(ActionsDoc {
            model: self.llm.model().to_string(),
            actions,
        })
        .await
    }
}

pub struct InsightsPhase {
    llm: Arc<dyn LlmClient>,
    tuning: PromptTuning,
}

#[async_trait]
impl Phase for InsightsPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Insights
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let themes: ThemesDoc = ctx.load(PhaseName::Themes).await?;
        let pulse: PulseDoc = ctx.load(PhaseName::Pulse).await?;
        let actions: ActionsDoc = ctx.load(PhaseName::Actions).await?;

        let prompt = insights_prompt(&themes, &pulse, &actions, self.tuning);
        let raw = call_llm(self.llm.as_ref(), PhaseName::Insights, &prompt).await?;
        let reply = parse_llm_json::<InsightsReply>(PhaseName::Insights, &raw)?
            .validate(&themes, &actions)?;
        ctx.persist(InsightsDoc {
            model: self.llm.model().to_string(),
            top_themes: reply.top_themes,
            top_quotes: reply.top_quotes,
            top_actions: reply.top_actions,
        })
        .await
    }
}

pub struct ReportPhase {
    app_name: String,
}

#[async_trait]
impl Phase for ReportPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Report
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let pulse: PulseDoc = ctx.load(PhaseName::Pulse).await?;
        let insights: InsightsDoc = ctx.load(PhaseName::Insights).await?;

        let html = render_report(&self.app_name, ctx.run_label, &pulse, &insights)?;
        let stored = ctx.write_side_file(REPORT_HTML, html.as_bytes()).await?;
        info!(path = %stored.relative_path.display(), bytes = stored.byte_size, "report rendered");
        ctx.persist(ReportDoc {
            html_path: stored.relative_path.display().to_string(),
            sha256: stored.content_hash,
            bytes: stored.byte_size as u64,
        })
        .await
    }
}

pub struct EmailPhase {
    mailer: Arc<dyn Mailer>,
    app_name: String,
    sender: String,
    recipient: Option<String>,
    draft_only: bool,
}

#[async_trait]
impl Phase for EmailPhase {
    fn name(&self) -> PhaseName {
        PhaseName::Email
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let pulse: PulseDoc = ctx.load(PhaseName::Pulse).await?;
        let insights: InsightsDoc = ctx.load(PhaseName::Insights).await?;
        let report: ReportDoc = ctx.load(PhaseName::Report).await?;

        let email = render_email(&self.app_name, ctx.run_label, &pulse, &insights, &report.html_path)?;
        let draft = ctx.write_side_file(EMAIL_HTML, email.html.as_bytes()).await?;
        ctx.write_side_file(EMAIL_TEXT, email.text.as_bytes()).await?;
        let draft_path = draft.relative_path.display().to_string();

        let unsent = |reason: &str| SendReceipt {
            recipient: self.recipient.clone(),
            subject: email.subject.clone(),
            sent: false,
            reason: Some(reason.to_string()),
            message_path: Some(draft_path.clone()),
        };

        let receipt = if self.draft_only {
            info!("draft-only run; mailer not called");
            unsent(DRAFT_ONLY_REASON)
        } else if let Some(to) = &self.recipient {
            let delivery = self
                .mailer
                .deliver(&EmailMessage {
                    from: self.sender.clone(),
                    to: to.clone(),
                    subject: email.subject.clone(),
                    html_body: email.html.clone(),
                    text_body: email.text.clone(),
                })
                .await
                .map_err(|err| PipelineError::external(PhaseName::Email, err))?;
            info!(to = %to, message_id = %delivery.message_id, "email delivered");
            SendReceipt {
                recipient: Some(to.clone()),
                subject: email.subject.clone(),
                sent: true,
                reason: None,
                message_path: delivery.location.or(Some(draft_path.clone())),
            }
        } else {
            warn!("no email recipient configured; skipping delivery");
            unsent(NO_RECIPIENT_REASON)
        };
        ctx.persist(receipt).await
    }
}

pub struct ArchivePhase {
    registry: RunRegistry,
}

#[async_trait]
impl Phase for ArchivePhase {
    fn name(&self) -> PhaseName {
        PhaseName::Archive
    }

    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<StoredArtifact, PipelineError> {
        let themes: ThemesDoc = ctx.load(PhaseName::Themes).await?;
        let pulse: PulseDoc = ctx.load(PhaseName::Pulse).await?;
        let receipt: SendReceipt = ctx.load(PhaseName::Email).await?;

        let entry = RegistryEntry {
            run_label: ctx.run_label.to_string(),
            completed_at: Utc::now(),
            health_score: pulse.health_score,
            health_label: pulse.health_label.clone(),
            top_theme_ids: themes.themes.iter().take(3).map(|t| t.theme_id.clone()).collect(),
            clean_review_count: pulse.rating_distribution.values().sum(),
            email_sent: receipt.sent,
        };
        // Envelope before registry line; a crash in between leaves archive pending.
        let stored = ctx.persist(entry.clone()).await?;
        self.registry.append(&entry).await?;
        Ok(stored)
    }
}
