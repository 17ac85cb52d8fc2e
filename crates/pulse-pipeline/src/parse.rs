use pulse_core::PhaseName;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::PipelineError;

pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parse an LLM reply into `T`.
///
/// Strict JSON first; if that fails, exactly one retry on the outermost
/// `{ ... }` span (models like to wrap JSON in prose). Anything else is a
/// schema validation failure for `phase`.
pub fn parse_llm_json<T: DeserializeOwned>(phase: PhaseName, raw: &str) -> Result<T, PipelineError> {
    let body = strip_code_blocks(raw);
    let strict_err = match serde_json::from_str::<T>(body) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
        if start < end {
            match serde_json::from_str::<T>(&body[start..=end]) {
                Ok(value) => {
                    warn!(%phase, "llm reply needed brace-span fallback");
                    return Ok(value);
                }
                Err(err) => return Err(PipelineError::schema(phase, err.to_string())),
            }
        }
    }
    Err(PipelineError::schema(phase, strict_err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        themes: Vec<String>,
    }

    #[test]
    fn strict_json_parses() {
        let reply: Reply = parse_llm_json(PhaseName::Themes, r#"{"themes":["a"]}"#).unwrap();
        assert_eq!(reply.themes, vec!["a"]);
    }

    #[test]
    fn fenced_json_parses() {
        let raw = "```json\n{\"themes\": [\"login\"]}\n```";
        let reply: Reply = parse_llm_json(PhaseName::Themes, raw).unwrap();
        assert_eq!(reply.themes, vec!["login"]);
    }

    #[test]
    fn prose_wrapped_json_uses_the_brace_span() {
        let raw = "Sure! Here you go: {\"themes\": [\"payouts\"]} Let me know.";
        let reply: Reply = parse_llm_json(PhaseName::Themes, raw).unwrap();
        assert_eq!(reply.themes, vec!["payouts"]);
    }

    #[test]
    fn unusable_replies_are_schema_failures() {
        for raw in ["no json here", "{\"themes\": 3}", "{ broken"] {
            let err = parse_llm_json::<Reply>(PhaseName::Pulse, raw).unwrap_err();
            assert!(
                matches!(err, PipelineError::SchemaValidationFailure { phase: PhaseName::Pulse, .. }),
                "{raw}: {err}"
            );
        }
    }
}
