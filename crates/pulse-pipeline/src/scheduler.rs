use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::service::PulseService;

/// Build a scheduler that runs the full plan for the previous ISO week on
/// `cron` (six fields, UTC). The caller starts it.
pub async fn build_weekly_scheduler(service: Arc<PulseService>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            info!("weekly pulse triggered");
            match service.run_current_week().await {
                Ok(report) => match report.failure() {
                    Some((phase, reason)) => warn!(%phase, %reason, "weekly run halted"),
                    None => info!(summary = %report.summary(), "weekly run finished"),
                },
                Err(err) => error!(error = %err, "weekly run could not start"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use pulse_adapters::{
        BackoffPolicy, ChatCompletionsClient, FixtureReviewSource, LlmClientConfig, OutboxMailer,
        ReviewSource,
    };
    use pulse_core::Platform;
    use tempfile::tempdir;

    use super::*;
    use crate::config::PipelineConfig;
    use crate::phases::Collaborators;

    fn service(root: &Path) -> Arc<PulseService> {
        let yaml = format!(
            "data_root: {}\napp:\n  name: Groww\nsources:\n  - platform: ios\n    path: ios.json\nllm:\n  model: m\n",
            root.display()
        );
        let config = PipelineConfig::from_yaml_str(&yaml, root).unwrap();
        let llm = ChatCompletionsClient::new(LlmClientConfig {
            base_url: "http://127.0.0.1:9".into(),
            api_key: "test".into(),
            model: "m".into(),
            timeout: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        })
        .unwrap();
        let collaborators = Collaborators {
            sources: vec![Arc::new(FixtureReviewSource::new(Platform::Ios, root.join("ios.json")))
                as Arc<dyn ReviewSource>],
            llm: Arc::new(llm),
            mailer: Arc::new(OutboxMailer::new(root.join("outbox"))),
        };
        Arc::new(PulseService::new(&config, collaborators))
    }

    #[tokio::test]
    async fn weekly_cron_builds_a_scheduler() {
        let dir = tempdir().unwrap();
        assert!(build_weekly_scheduler(service(dir.path()), "0 0 7 * * Mon").await.is_ok());
    }

    #[tokio::test]
    async fn malformed_cron_is_rejected() {
        let dir = tempdir().unwrap();
        let err = build_weekly_scheduler(service(dir.path()), "every monday")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("every monday"));
    }
}
