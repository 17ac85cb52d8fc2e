use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use pulse_adapters::{ChatCompletionsClient, FixtureReviewSource, OutboxMailer, ReviewSource};
use pulse_core::{resolve_run, PhaseName, RunTarget};
use pulse_storage::RunRegistry;
use tracing::info;

use crate::config::PipelineConfig;
use crate::dispatcher::{Dispatcher, PhaseOutcome, RunPlan, RunReport};
use crate::error::PipelineError;
use crate::phases::{standard_phases, Collaborators, PhaseSettings};

/// Entry point shared by the CLI and the scheduler: a dispatcher over the
/// standard phase set.
pub struct PulseService {
    dispatcher: Dispatcher,
}

impl PulseService {
    pub fn new(config: &PipelineConfig, collaborators: Collaborators) -> Self {
        let phases = standard_phases(
            PhaseSettings::from_config(config),
            collaborators,
            RunRegistry::new(&config.data_root),
        );
        Self {
            dispatcher: Dispatcher::new(config.data_root.clone(), phases),
        }
    }

    /// Wire the shipped adapters: fixture sources pinned to the configured
    /// store ids, the chat-completions client and the outbox mailer.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let sources: Vec<Arc<dyn ReviewSource>> = config
            .ordered_sources()
            .into_iter()
            .map(|s| {
                let app_id = config.app.store_id(s.platform).map(str::to_string);
                Arc::new(FixtureReviewSource::new(s.platform, s.path.clone()).with_app_id(app_id))
                    as Arc<dyn ReviewSource>
            })
            .collect();
        let llm = ChatCompletionsClient::new(config.llm_client_config()?)
            .context("building llm client")?;
        let mailer = OutboxMailer::new(config.outbox_dir());
        let collaborators = Collaborators {
            sources,
            llm: Arc::new(llm),
            mailer: Arc::new(mailer),
        };
        Ok(Self::new(config, collaborators))
    }

    pub async fn run(
        &self,
        target: &RunTarget,
        plan: &RunPlan,
        force_phase: Option<PhaseName>,
    ) -> Result<RunReport, PipelineError> {
        info!(
            run_label = %target.run_label,
            from = %target.window.date_from,
            to = %target.window.date_to,
            phases = plan.phases().len(),
            "starting pulse run"
        );
        self.dispatcher.run(target, plan, force_phase).await
    }

    /// Run a single phase. The run is begun first so a fresh label gets
    /// its state file and window.
    pub async fn run_phase(
        &self,
        target: &RunTarget,
        phase: PhaseName,
        force: bool,
    ) -> Result<PhaseOutcome, PipelineError> {
        self.dispatcher.begin(target).await?;
        self.dispatcher.run_phase(&target.run_label, phase, force).await
    }

    /// Full plan for last week's label; what the weekly schedule triggers.
    pub async fn run_current_week(&self) -> Result<RunReport, PipelineError> {
        let today = Utc::now().date_naive();
        let target = resolve_run(None, None, today).map_err(|err| PipelineError::Storage(err.into()))?;
        self.run(&target, &RunPlan::full(), None).await
    }
}
