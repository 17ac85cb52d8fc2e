//! Structured prompts for the LLM phases and the reply shapes they demand.

use std::collections::HashSet;

use pulse_adapters::ChatPrompt;
use pulse_core::{
    slugify, ActionItem, ActionsDoc, InsightAction, InsightTheme, PhaseName, PulseDoc, SampleSet,
    Theme, ThemesDoc,
};
use serde::Deserialize;

use crate::error::PipelineError;

const MAX_BODY_CHARS: usize = 300;
const INSIGHT_ITEMS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct PromptTuning {
    pub temperature: f32,
    pub max_tokens: u32,
}

const THEMES_SYSTEM: &str = "You are a senior product analyst. Read real app store reviews and extract the dominant themes users talk about.

Output rules:
- Respond with ONLY valid JSON, no prose and no markdown fences.
- Single top-level key \"themes\" (an array).
- Each theme object has: \"theme_name\" (3-5 words), \"description\" (one sentence), \"sentiment\" (\"positive\" | \"negative\" | \"mixed\"), \"review_count\" (integer), \"avg_rating\" (float, 1 decimal), \"example_quotes\" (2-3 verbatim short quotes).
- Return 6-10 themes ordered by review_count descending. Skip themes with fewer than 3 mentions.";

const PULSE_SYSTEM: &str = "You are a senior product manager writing a weekly Product Health Pulse for the internal PM and leadership team.

Output rules:
- Respond with ONLY valid JSON, no prose and no markdown fences.
- Keys: \"summary\" (2-3 sentences), \"top_positives\" (2-3 theme names), \"top_negatives\" (2-3 theme names), \"watch_list\" (0-3 theme names), \"pm_note\" (one actionable sentence).
- Be concise and factual. Use only the data provided.";

const ACTIONS_SYSTEM: &str = "You are a senior product manager turning app review insights into a prioritised action plan.

Output rules:
- Respond with ONLY valid JSON, no prose and no markdown fences.
- Top-level key \"actions\" (an array). Each action has: \"priority\" (\"P1\" | \"P2\" | \"P3\"), \"category\" (\"Bug Fix\" | \"Feature\" | \"UX\" | \"Support\" | \"Trust & Safety\" | \"Other\"), \"title\" (max 10 words), \"description\" (1-2 sentences), \"theme_source\", \"effort\" (\"Low\" | \"Medium\" | \"High\"), \"expected_impact\" (one sentence).
- Return exactly 3 actions ordered P1, P2, P3. Every P1 must come from a negative or mixed theme.";

const INSIGHTS_SYSTEM: &str = "You are a senior product manager curating a weekly executive briefing.

Output rules:
- Respond with ONLY valid JSON.
- Keys: \"top_themes\" (objects with name, sentiment, description), \"top_quotes\" (strings), \"top_actions\" (objects with title, description, priority).
- Exactly 3 items per list. Use the provided data only. Prefer high-impact negative or mixed themes and P1 actions.";

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let flat = text.replace(['\n', '\r'], " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{cut}...")
}

pub fn themes_prompt(sample: &SampleSet, tuning: PromptTuning) -> ChatPrompt {
    let mut lines = vec![
        format!("Below are {} app store reviews for analysis.", sample.reviews.len()),
        "Extract the dominant themes as described in your instructions.".to_string(),
        String::new(),
        "--- REVIEWS ---".to_string(),
    ];
    for (i, r) in sample.reviews.iter().enumerate() {
        lines.push(format!(
            "[{}] ({} | {}★ | {}) {}",
            i + 1,
            r.review.source.as_str().to_uppercase(),
            r.review.rating,
            r.week_id,
            truncate_chars(&r.review.text, MAX_BODY_CHARS)
        ));
    }
    lines.push(String::new());
    lines.push("Respond with the JSON object now.".to_string());
    ChatPrompt {
        system: THEMES_SYSTEM.to_string(),
        user: lines.join("\n"),
        temperature: tuning.temperature,
        max_tokens: tuning.max_tokens,
    }
}

pub fn pulse_prompt(
    run_label: &str,
    themes: &ThemesDoc,
    score: &crate::score::HealthScore,
    tuning: PromptTuning,
) -> ChatPrompt {
    let mut lines = vec![
        format!("Weekly App Review Pulse: {run_label}"),
        format!("Health Score: {}/100 ({})", score.score, score.label),
        format!("Weighted Avg Rating: {:.2}/5.0", score.weighted_avg_rating),
        format!("Total Reviews Analysed: {}", score.total_reviews),
        String::new(),
        "Extracted Themes (ordered by volume):".to_string(),
    ];
    for t in &themes.themes {
        lines.push(format!(
            "  - [{}] {} | {} reviews | {:.1}★ | \"{}\" | Quotes: {:?}",
            t.sentiment.as_str().to_uppercase(),
            t.theme_name,
            t.review_count,
            t.avg_rating,
            t.description,
            t.example_quotes
        ));
    }
    ChatPrompt {
        system: PULSE_SYSTEM.to_string(),
        user: lines.join("\n"),
        temperature: tuning.temperature,
        max_tokens: tuning.max_tokens,
    }
}

pub fn actions_prompt(
    run_label: &str,
    pulse: &PulseDoc,
    themes: &ThemesDoc,
    tuning: PromptTuning,
) -> ChatPrompt {
    let mut lines = vec![
        format!("App Review Action Plan: {run_label}"),
        format!("Health Score: {}/100 ({})", pulse.health_score, pulse.health_label),
        format!("Avg Rating  : {:.2}/5.0", pulse.weighted_avg_rating),
        String::new(),
        format!("Summary    : {}", pulse.summary),
        format!("PM Note    : {}", pulse.pm_note),
        format!("Top Neg    : {}", pulse.top_negatives.join(", ")),
        format!("Watch List : {}", pulse.watch_list.join(", ")),
        String::new(),
        "Themes:".to_string(),
    ];
    for t in &themes.themes {
        lines.push(format!(
            "  - [{}] {} ({} reviews, {:.1}★): {}",
            t.sentiment.as_str().to_uppercase(),
            t.theme_name,
            t.review_count,
            t.avg_rating,
            t.description
        ));
    }
    ChatPrompt {
        system: ACTIONS_SYSTEM.to_string(),
        user: lines.join("\n"),
        temperature: tuning.temperature,
        max_tokens: tuning.max_tokens,
    }
}

pub fn insights_prompt(
    themes: &ThemesDoc,
    pulse: &PulseDoc,
    actions: &ActionsDoc,
    tuning: PromptTuning,
) -> ChatPrompt {
    let mut lines = vec!["RAW THEMES DATA:".to_string()];
    for t in themes.themes.iter().take(8) {
        lines.push(format!(
            "- [{}] {}: {}",
            t.sentiment.as_str().to_uppercase(),
            t.theme_name,
            t.description
        ));
        if !t.example_quotes.is_empty() {
            let quotes: Vec<_> = t.example_quotes.iter().take(2).collect();
            lines.push(format!("  Quotes: {quotes:?}"));
        }
    }
    lines.push(String::new());
    lines.push("ACTION ITEMS DATA:".to_string());
    for a in &actions.actions {
        lines.push(format!("- [{:?}] {}: {}", a.priority, a.title, a.description));
    }
    lines.push(String::new());
    lines.push(format!(
        "PULSE: {}/100 ({}). {}",
        pulse.health_score, pulse.health_label, pulse.summary
    ));
    ChatPrompt {
        system: INSIGHTS_SYSTEM.to_string(),
        user: lines.join("\n"),
        temperature: tuning.temperature,
        max_tokens: tuning.max_tokens,
    }
}

#[derive(Debug, Deserialize)]
pub struct ThemesReply {
    pub themes: Vec<Theme>,
}

impl ThemesReply {
    /// Reject empty or out-of-range replies, assign stable ids, order by volume.
    pub fn validate(mut self) -> Result<Vec<Theme>, PipelineError> {
        if self.themes.is_empty() {
            return Err(PipelineError::schema(PhaseName::Themes, "reply contains no themes"));
        }
        let mut used = HashSet::new();
        for theme in &mut self.themes {
            if theme.theme_name.trim().is_empty() {
                return Err(PipelineError::schema(PhaseName::Themes, "theme without a name"));
            }
            if !(0.0..=5.0).contains(&theme.avg_rating) {
                return Err(PipelineError::schema(
                    PhaseName::Themes,
                    format!("`{}` has avg_rating {}", theme.theme_name, theme.avg_rating),
                ));
            }
            let base = match slugify(&theme.theme_name) {
                s if s.is_empty() => "theme".to_string(),
                s => s,
            };
            let mut id = base.clone();
            let mut n = 2;
            while !used.insert(id.clone()) {
                id = format!("{base}-{n}");
                n += 1;
            }
            theme.theme_id = id;
        }
        self.themes.sort_by(|a, b| b.review_count.cmp(&a.review_count));
        Ok(self.themes)
    }
}

#[derive(Debug, Deserialize)]
pub struct PulseNarrative {
    pub summary: String,
    #[serde(default)]
    pub top_positives: Vec<String>,
    #[serde(default)]
    pub top_negatives: Vec<String>,
    #[serde(default)]
    pub watch_list: Vec<String>,
    #[serde(default)]
    pub pm_note: String,
}

impl PulseNarrative {
    pub fn validate(self) -> Result<Self, PipelineError> {
        if self.summary.trim().is_empty() {
            return Err(PipelineError::schema(PhaseName::Pulse, "summary is empty"));
        }
        Ok(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct ActionsReply {
    pub actions: Vec<ActionItem>,
}

impl ActionsReply {
    pub fn validate(mut self) -> Result<Vec<ActionItem>, PipelineError> {
        if self.actions.is_empty() {
            return Err(PipelineError::schema(PhaseName::Actions, "reply contains no actions"));
        }
        if let Some(untitled) = self.actions.iter().position(|a| a.title.trim().is_empty()) {
            return Err(PipelineError::schema(
                PhaseName::Actions,
                format!("action {} has no title", untitled + 1),
            ));
        }
        self.actions.sort_by_key(|a| a.priority);
        Ok(self.actions)
    }
}

#[derive(Debug, Deserialize)]
pub struct InsightsReply {
    pub top_themes: Vec<InsightTheme>,
    pub top_quotes: Vec<String>,
    pub top_actions: Vec<InsightAction>,
}

impl InsightsReply {
    /// Trim each list to three and require three unless upstream had fewer.
    pub fn validate(
        mut self,
        themes: &ThemesDoc,
        actions: &ActionsDoc,
    ) -> Result<Self, PipelineError> {
        self.top_themes.truncate(INSIGHT_ITEMS);
        self.top_quotes.truncate(INSIGHT_ITEMS);
        self.top_actions.truncate(INSIGHT_ITEMS);

        let quotes_available: usize = themes.themes.iter().map(|t| t.example_quotes.len()).sum();
        let checks = [
            ("top_themes", self.top_themes.len(), themes.themes.len()),
            ("top_quotes", self.top_quotes.len(), quotes_available),
            ("top_actions", self.top_actions.len(), actions.actions.len()),
        ];
        for (field, got, upstream) in checks {
            let expected = INSIGHT_ITEMS.min(upstream);
            if got < expected {
                return Err(PipelineError::schema(
                    PhaseName::Insights,
                    format!("{field} has {got} items, expected {expected}"),
                ));
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_llm_json;
    use pulse_core::{Priority, Sentiment};

    fn tuning() -> PromptTuning {
        PromptTuning {
            temperature: 0.2,
            max_tokens: 1024,
        }
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundaries() {
        let body = "é".repeat(400);
        let out = truncate_chars(&body, 300);
        assert_eq!(out.chars().count(), 300);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_chars("line\nbreak", 300), "line break");
    }

    #[test]
    fn themes_prompt_lists_every_sampled_review() {
        let sample = SampleSet {
            target_size: 120,
            min_per_bucket: 3,
            corpus_size: 0,
            allocations: vec![],
            reviews: vec![],
        };
        let prompt = themes_prompt(&sample, tuning());
        assert!(prompt.user.starts_with("Below are 0 app store reviews"));
        assert!(prompt.system.contains("\"themes\""));
        assert_eq!(prompt.max_tokens, 1024);
    }

    #[test]
    fn theme_replies_get_unique_slug_ids_in_volume_order() {
        let raw = r#"{"themes": [
            {"theme_name": "Login Issues", "description": "d", "sentiment": "negative", "review_count": 10, "avg_rating": 1.4},
            {"theme_name": "Login issues!", "description": "d", "sentiment": "mixed", "review_count": 30, "avg_rating": 2.9, "example_quotes": ["otp late"]}
        ]}"#;
        let themes = parse_llm_json::<ThemesReply>(PhaseName::Themes, raw)
            .unwrap()
            .validate()
            .unwrap();
        assert_eq!(themes[0].theme_id, "login-issues-2");
        assert_eq!(themes[0].review_count, 30);
        assert_eq!(themes[1].theme_id, "login-issues");
        assert_eq!(themes[1].sentiment, Sentiment::Negative);
    }

    #[test]
    fn out_of_range_ratings_fail_validation() {
        let raw = r#"{"themes": [{"theme_name": "x", "description": "d", "sentiment": "positive", "review_count": 3, "avg_rating": 7.0}]}"#;
        let err = parse_llm_json::<ThemesReply>(PhaseName::Themes, raw)
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaValidationFailure { .. }));
    }

    #[test]
    fn unknown_priorities_are_rejected_and_known_ones_sorted() {
        let bad = r#"{"actions": [{"priority": "P0", "category": "UX", "title": "t", "description": "d", "theme_source": "s", "effort": "Low", "expected_impact": "i"}]}"#;
        assert!(parse_llm_json::<ActionsReply>(PhaseName::Actions, bad).is_err());

        let good = r#"{"actions": [
            {"priority": "P3", "category": "UX", "title": "polish", "description": "d", "theme_source": "s", "effort": "Low", "expected_impact": "i"},
            {"priority": "P1", "category": "Bug Fix", "title": "fix otp", "description": "d", "theme_source": "s", "effort": "High", "expected_impact": "i"}
        ]}"#;
        let actions = parse_llm_json::<ActionsReply>(PhaseName::Actions, good)
            .unwrap()
            .validate()
            .unwrap();
        assert_eq!(actions[0].priority, Priority::P1);
    }
}
