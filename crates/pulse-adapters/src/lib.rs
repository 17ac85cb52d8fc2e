//! Collaborator contracts (review sources, LLM, mail delivery) and the
//! reference adapters the pipeline ships with.

use async_trait::async_trait;
use pulse_core::{Platform, RawReview, RunWindow};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod llm;
mod mail;
mod sources;

pub use llm::{
    classify_reqwest_error, classify_status, BackoffPolicy, ChatCompletionsClient, LlmClientConfig,
    RetryDisposition,
};
pub use mail::OutboxMailer;
pub use sources::{FixtureBundle, FixtureReviewSource};

pub const CRATE_NAME: &str = "pulse-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("environment variable `{0}` is not set")]
    MissingCredential(String),
    #[error("http status {status} from {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Scraping collaborator boundary.
///
/// Implementations must return records in a stable order for identical
/// upstream data: deduplication keeps the first-seen record, so ordering
/// drift changes which duplicate survives.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    fn platform(&self) -> Platform;

    async fn fetch(&self, window: &RunWindow) -> Result<Vec<RawReview>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPrompt {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// LLM boundary: one structured prompt in, raw assistant text out.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, prompt: &ChatPrompt) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub location: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, message: &EmailMessage) -> Result<DeliveryReceipt, AdapterError>;
}
