use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use anyhow::anyhow;
use pulse_core::{PhaseName, PhaseStatus, RunTarget};
use pulse_storage::{ArtifactStore, PhaseStateStore, RunState};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};

use crate::error::PipelineError;
use crate::phases::{Phase, PhaseContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Skipped,
    Executed { output_path: String },
    Failed { reason: String },
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Skipped => f.write_str("skipped (already done)"),
            PhaseOutcome::Executed { output_path } => write!(f, "done -> {output_path}"),
            PhaseOutcome::Failed { reason } => write!(f, "FAILED: {reason}"),
        }
    }
}

/// Ordered phases to walk. Every dependency edge between phases inside the
/// plan points backwards; upstream phases outside the plan must already be
/// done when their dependant runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    phases: Vec<PhaseName>,
}

impl RunPlan {
    pub fn new(phases: Vec<PhaseName>) -> Result<Self, PipelineError> {
        if phases.is_empty() {
            return Err(PipelineError::InvalidPlan("plan has no phases".into()));
        }
        let mut seen = HashSet::new();
        for (idx, phase) in phases.iter().enumerate() {
            if !seen.insert(*phase) {
                return Err(PipelineError::InvalidPlan(format!("`{phase}` appears twice")));
            }
            for upstream in phase.depends_on() {
                if let Some(pos) = phases.iter().position(|p| p == upstream) {
                    if pos > idx {
                        return Err(PipelineError::InvalidPlan(format!(
                            "`{phase}` is scheduled before its dependency `{upstream}`"
                        )));
                    }
                }
            }
        }
        Ok(Self { phases })
    }

    pub fn full() -> Self {
        Self {
            phases: PhaseName::ALL.to_vec(),
        }
    }

    pub fn phases(&self) -> &[PhaseName] {
        &self.phases
    }

    pub fn contains(&self, phase: PhaseName) -> bool {
        self.phases.contains(&phase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_label: String,
    pub outcomes: Vec<(PhaseName, PhaseOutcome)>,
}

impl RunReport {
    pub fn all_skipped(&self) -> bool {
        !self.outcomes.is_empty()
            && self
                .outcomes
                .iter()
                .all(|(_, o)| matches!(o, PhaseOutcome::Skipped))
    }

    pub fn failure(&self) -> Option<(PhaseName, &str)> {
        self.outcomes.iter().find_map(|(phase, outcome)| match outcome {
            PhaseOutcome::Failed { reason } => Some((*phase, reason.as_str())),
            _ => None,
        })
    }

    pub fn executed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, PhaseOutcome::Executed { .. }))
            .count()
    }

    pub fn summary(&self) -> String {
        if self.all_skipped() {
            return format!("{}: all phases already complete", self.run_label);
        }
        match self.failure() {
            Some((phase, reason)) => format!("{}: halted at {phase}: {reason}", self.run_label),
            None => format!(
                "{}: {} phase(s) executed, {} skipped",
                self.run_label,
                self.executed(),
                self.outcomes.len() - self.executed()
            ),
        }
    }
}

/// Sequences phases over the file-backed state machine.
///
/// The dispatcher is the only writer of run state: phases persist artifacts,
/// the dispatcher then records them as done.
pub struct Dispatcher {
    store: ArtifactStore,
    state: PhaseStateStore,
    phases: BTreeMap<PhaseName, Box<dyn Phase>>,
}

impl Dispatcher {
    pub fn new(data_root: impl Into<PathBuf>, phases: Vec<Box<dyn Phase>>) -> Self {
        let root = data_root.into();
        Self {
            store: ArtifactStore::new(root.clone()),
            state: PhaseStateStore::new(root),
            phases: phases.into_iter().map(|p| (p.name(), p)).collect(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn state_store(&self) -> &PhaseStateStore {
        &self.state
    }

    /// Create (or reopen) the run's state file and pin its ingestion window.
    pub async fn begin(&self, target: &RunTarget) -> Result<RunState, PipelineError> {
        Ok(self.state.init_run(&target.run_label, target.window).await?)
    }

    pub async fn status(&self, run_label: &str) -> Result<RunState, PipelineError> {
        Ok(self.state.load(run_label).await?)
    }

    /// Apply the idempotency and force policy to one phase.
    ///
    /// * not forced and done: `Skipped`, no collaborator call
    /// * not forced and failed: `Failed` with the recorded reason, no call
    /// * forced: cleared, then executed regardless of prior status
    ///
    /// Upstream phases are checked before anything is cleared or called.
    pub async fn run_phase(
        &self,
        run_label: &str,
        phase: PhaseName,
        force: bool,
    ) -> Result<PhaseOutcome, PipelineError> {
        let span = info_span!("phase", run_label = %run_label, phase = %phase, force);
        self.run_phase_inner(run_label, phase, force)
            .instrument(span)
            .await
    }

    async fn run_phase_inner(
        &self,
        run_label: &str,
        phase: PhaseName,
        force: bool,
    ) -> Result<PhaseOutcome, PipelineError> {
        let handler = self
            .phases
            .get(&phase)
            .ok_or_else(|| PipelineError::InvalidPlan(format!("no handler registered for `{phase}`")))?;

        let mut state = self.state.load(run_label).await?;
        if !force {
            match state.status(phase) {
                PhaseStatus::Done => {
                    info!("already done; skipping");
                    return Ok(PhaseOutcome::Skipped);
                }
                PhaseStatus::Failed => {
                    let reason = state
                        .record(phase)
                        .error
                        .unwrap_or_else(|| "failed previously".to_string());
                    info!(%reason, "previously failed; use force to retry");
                    return Ok(PhaseOutcome::Failed { reason });
                }
                PhaseStatus::Pending => {}
            }
        }

        if let Some(upstream) = phase
            .depends_on()
            .iter()
            .find(|u| state.status(**u) != PhaseStatus::Done)
        {
            return Err(PipelineError::MissingDependency {
                phase,
                upstream: *upstream,
            });
        }

        if force && state.status(phase) != PhaseStatus::Pending {
            self.state.clear(run_label, phase).await?;
            state = self.state.load(run_label).await?;
        }

        let window = state
            .window
            .ok_or_else(|| anyhow!("run `{run_label}` has no ingestion window; begin the run first"))?;
        let ctx = PhaseContext {
            phase,
            run_label,
            window,
            store: &self.store,
            state: &state,
        };

        match handler.execute(&ctx).await {
            Ok(stored) => {
                let output_path = stored.relative_path.display().to_string();
                self.state.mark_done(run_label, phase, &output_path).await?;
                info!(output = %output_path, hash = %stored.content_hash, "phase done");
                Ok(PhaseOutcome::Executed { output_path })
            }
            Err(err) => {
                let reason = err.to_string();
                error!(%reason, "phase failed");
                self.state.mark_failed(run_label, phase, &reason).await?;
                Ok(PhaseOutcome::Failed { reason })
            }
        }
    }

    /// Walk `plan` in order, stopping at the first failure.
    ///
    /// The plan, the force target and every dependency edge (against the
    /// persisted run state) are validated before any phase runs.
    pub async fn run(
        &self,
        target: &RunTarget,
        plan: &RunPlan,
        force_phase: Option<PhaseName>,
    ) -> Result<RunReport, PipelineError> {
        if let Some(forced) = force_phase {
            if !plan.contains(forced) {
                return Err(PipelineError::InvalidPlan(format!(
                    "forced phase `{forced}` is not part of the plan"
                )));
            }
        }
        if let Some(missing) = plan.phases().iter().find(|p| !self.phases.contains_key(*p)) {
            return Err(PipelineError::InvalidPlan(format!(
                "no handler registered for `{missing}`"
            )));
        }

        let state = self.begin(target).await?;
        check_plan_edges(plan, &state)?;
        let run_label = target.run_label.as_str();
        let mut outcomes = Vec::with_capacity(plan.phases().len());
        for &phase in plan.phases() {
            let outcome = self
                .run_phase(run_label, phase, force_phase == Some(phase))
                .await?;
            let halted = matches!(outcome, PhaseOutcome::Failed { .. });
            outcomes.push((phase, outcome));
            if halted {
                break;
            }
        }

        let report = RunReport {
            run_label: run_label.to_string(),
            outcomes,
        };
        info!(run_label, summary = %report.summary(), "run finished");
        Ok(report)
    }
}

/// Every upstream of a planned phase must either run earlier in the plan or
/// already be done.
fn check_plan_edges(plan: &RunPlan, state: &RunState) -> Result<(), PipelineError> {
    for (idx, &phase) in plan.phases().iter().enumerate() {
        let scheduled_earlier = &plan.phases()[..idx];
        if let Some(&upstream) = phase.depends_on().iter().find(|u| {
            !scheduled_earlier.contains(*u) && state.status(**u) != PhaseStatus::Done
        }) {
            return Err(PipelineError::MissingDependency { phase, upstream });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_plan_is_valid() {
        assert_eq!(RunPlan::new(PhaseName::ALL.to_vec()).unwrap(), RunPlan::full());
        assert_eq!(RunPlan::full().phases().len(), 10);
    }

    #[test]
    fn plans_with_forward_edges_are_rejected() {
        let err = RunPlan::new(vec![PhaseName::Themes, PhaseName::Sample]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPlan(_)));
        assert!(err.to_string().contains("`themes` is scheduled before its dependency `sample`"));
    }

    #[test]
    fn duplicate_and_empty_plans_are_rejected() {
        assert!(RunPlan::new(vec![]).is_err());
        assert!(RunPlan::new(vec![PhaseName::Ingest, PhaseName::Ingest]).is_err());
    }

    #[test]
    fn partial_plans_may_rely_on_done_upstreams() {
        let plan = RunPlan::new(vec![PhaseName::Report, PhaseName::Email]).unwrap();
        assert!(plan.contains(PhaseName::Email));
        assert!(!plan.contains(PhaseName::Pulse));
    }

    #[test]
    fn report_summary_mentions_completion() {
        let report = RunReport {
            run_label: "2026-W07".into(),
            outcomes: vec![
                (PhaseName::Ingest, PhaseOutcome::Skipped),
                (PhaseName::Clean, PhaseOutcome::Skipped),
            ],
        };
        assert!(report.all_skipped());
        assert_eq!(report.summary(), "2026-W07: all phases already complete");

        let failed = RunReport {
            run_label: "2026-W07".into(),
            outcomes: vec![
                (PhaseName::Ingest, PhaseOutcome::Skipped),
                (PhaseName::Clean, PhaseOutcome::Failed { reason: "disk full".into() }),
            ],
        };
        assert_eq!(failed.failure(), Some((PhaseName::Clean, "disk full")));
        assert_eq!(failed.summary(), "2026-W07: halted at clean: disk full");
    }
}
