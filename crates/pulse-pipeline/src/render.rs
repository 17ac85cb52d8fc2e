use anyhow::{anyhow, Result};
use askama::Template;
use pulse_core::{InsightsDoc, PulseDoc};

#[derive(Debug, Clone)]
struct DistributionRow {
    rating: u8,
    count: usize,
    percent: u32,
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate<'a> {
    app_name: &'a str,
    run_label: &'a str,
    label_class: String,
    pulse: &'a PulseDoc,
    insights: &'a InsightsDoc,
    distribution: Vec<DistributionRow>,
}

#[derive(Template)]
#[template(path = "email.html")]
struct EmailHtmlTemplate<'a> {
    app_name: &'a str,
    run_label: &'a str,
    pulse: &'a PulseDoc,
    insights: &'a InsightsDoc,
    report_path: &'a str,
}

#[derive(Template)]
#[template(path = "email.txt")]
struct EmailTextTemplate<'a> {
    app_name: &'a str,
    run_label: &'a str,
    pulse: &'a PulseDoc,
    insights: &'a InsightsDoc,
    report_path: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

pub fn email_subject(run_label: &str, pulse: &PulseDoc) -> String {
    format!(
        "[App Pulse] {run_label} - {} ({}/100)",
        pulse.health_label, pulse.health_score
    )
}

fn distribution_rows(pulse: &PulseDoc) -> Vec<DistributionRow> {
    let total: usize = pulse.rating_distribution.values().sum();
    pulse
        .rating_distribution
        .iter()
        .rev()
        .map(|(&rating, &count)| DistributionRow {
            rating,
            count,
            percent: if total == 0 {
                0
            } else {
                (count * 100 / total) as u32
            },
        })
        .collect()
}

/// Render the standalone HTML report. Output depends only on the inputs.
pub fn render_report(
    app_name: &str,
    run_label: &str,
    pulse: &PulseDoc,
    insights: &InsightsDoc,
) -> Result<String> {
    ReportTemplate {
        app_name,
        run_label,
        label_class: format!("label-{}", pulse.health_label.to_lowercase().replace(' ', "-")),
        pulse,
        insights,
        distribution: distribution_rows(pulse),
    }
    .render()
    .map_err(|err| anyhow!("rendering report.html: {err}"))
}

pub fn render_email(
    app_name: &str,
    run_label: &str,
    pulse: &PulseDoc,
    insights: &InsightsDoc,
    report_path: &str,
) -> Result<RenderedEmail> {
    let html = EmailHtmlTemplate {
        app_name,
        run_label,
        pulse,
        insights,
        report_path,
    }
    .render()
    .map_err(|err| anyhow!("rendering email.html: {err}"))?;
    let text = EmailTextTemplate {
        app_name,
        run_label,
        pulse,
        insights,
        report_path,
    }
    .render()
    .map_err(|err| anyhow!("rendering email.txt: {err}"))?;
    Ok(RenderedEmail {
        subject: email_subject(run_label, pulse),
        html,
        text,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use pulse_core::{InsightAction, InsightTheme, InsightsDoc, Priority, PulseDoc, Sentiment};

    pub fn pulse() -> PulseDoc {
        PulseDoc {
            model: "test-model".into(),
            health_score: 58,
            health_label: "At Risk".into(),
            weighted_avg_rating: 3.1,
            total_reviews: 40,
            corpus_avg_rating: 3.4,
            rating_distribution: BTreeMap::from([(1, 10), (2, 2), (3, 3), (4, 5), (5, 20)]),
            summary: "Payout delays <dominate> this week.".into(),
            top_positives: vec!["Easy onboarding".into()],
            top_negatives: vec!["Payout delays".into()],
            watch_list: vec![],
            pm_note: "Escalate the payout backlog.".into(),
        }
    }

    pub fn insights() -> InsightsDoc {
        InsightsDoc {
            model: "test-model".into(),
            top_themes: vec![InsightTheme {
                name: "Payout delays".into(),
                sentiment: Sentiment::Negative,
                description: "Withdrawals take days.".into(),
            }],
            top_quotes: vec!["Still waiting on my money".into()],
            top_actions: vec![InsightAction {
                title: "Fix payout queue".into(),
                description: "Drain the stuck batch.".into(),
                priority: Priority::P1,
            }],
        }
    }
}
