//! Classifier client.
//!
//! Layers, innermost first:
//! - [`CompletionClient`]: one raw model call (HTTP in production)
//! - [`LlmClassifier`]: prompt construction plus schema and taxonomy validation
//! - [`ResilientClassifier`]: retry contract (backoff, strict re-prompt, fatal abort)
//!
//! The pipeline only sees the [`Classifier`] trait.

mod http;
mod parse;
mod prompt;
mod retry;

pub use http::{create_completion_client, HttpCompletionClient};
pub use retry::{retry_transient, ResilientClassifier, RetryPolicy};

use crate::instructions::Instructions;
use crate::taxonomy::Taxonomy;
use crate::types::{ClassificationKind, Role, ScoreMap};
use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// One session transcript line
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One message to classify
#[derive(Debug, Clone, PartialEq)]
pub struct MessageItem {
    pub message_id: i64,
    pub text: String,
}

/// What the model is asked to classify
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierInput {
    Session {
        session_id: String,
        transcript: Vec<TranscriptEntry>,
    },
    Messages {
        items: Vec<MessageItem>,
    },
}

impl ClassifierInput {
    pub fn kind(&self) -> ClassificationKind {
        match self {
            ClassifierInput::Session { .. } => ClassificationKind::Session,
            ClassifierInput::Messages { .. } => ClassificationKind::Message,
        }
    }
}

/// A single classification call
#[derive(Debug, Clone, Copy)]
pub struct ClassifyRequest<'a> {
    pub input: &'a ClassifierInput,
    pub instructions: &'a Instructions,
    /// Set on the re-prompt after a schema violation
    pub strict: bool,
}

impl<'a> ClassifyRequest<'a> {
    pub fn new(input: &'a ClassifierInput, instructions: &'a Instructions) -> Self {
        Self {
            input,
            instructions,
            strict: false,
        }
    }

    pub fn kind(&self) -> ClassificationKind {
        self.input.kind()
    }
}

/// A validated label assignment
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub primary_category: String,
    pub scores: ScoreMap,
    /// The model named a primary category but gave it no score; it was set to 0
    pub primary_score_missing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageVerdict {
    pub message_id: i64,
    pub verdict: Verdict,
}

/// Structured classifier result
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierOutput {
    Session {
        verdict: Verdict,
        rationale: Option<String>,
    },
    /// One entry per sent message, in request order
    Messages(Vec<MessageVerdict>),
}

impl ClassifierOutput {
    pub fn into_session(self) -> Result<(Verdict, Option<String>)> {
        match self {
            ClassifierOutput::Session { verdict, rationale } => Ok((verdict, rationale)),
            ClassifierOutput::Messages(_) => Err(Error::SchemaViolation(
                "expected a session result, got message results".to_string(),
            )),
        }
    }

    pub fn into_messages(self) -> Result<Vec<MessageVerdict>> {
        match self {
            ClassifierOutput::Messages(items) => Ok(items),
            ClassifierOutput::Session { .. } => Err(Error::SchemaViolation(
                "expected message results, got a session result".to_string(),
            )),
        }
    }
}

/// Classification backend.
///
/// Failures must be one of [`Error::Transient`], [`Error::SchemaViolation`]
/// or [`Error::Fatal`] (wrappers may add [`Error::RetriesExhausted`]).
pub trait Classifier: Send + Sync {
    /// Model identifier recorded on result rows
    fn model(&self) -> &str;

    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<ClassifierOutput>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn model(&self) -> &str {
        (**self).model()
    }

    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<ClassifierOutput> {
        (**self).classify(request)
    }
}

/// One raw model completion.
pub trait CompletionClient: Send + Sync {
    fn model(&self) -> &str;

    /// Send `system` + `user` and return the model's text reply
    fn complete(&self, system: &str, user: &str) -> Result<String>;
}

impl<C: CompletionClient + ?Sized> CompletionClient for Box<C> {
    fn model(&self) -> &str {
        (**self).model()
    }

    fn complete(&self, system: &str, user: &str) -> Result<String> {
        (**self).complete(system, user)
    }
}

/// Builds prompts, calls the model, validates the reply against the taxonomy.
pub struct LlmClassifier<C> {
    client: C,
    taxonomy: Taxonomy,
}

impl<C: CompletionClient> LlmClassifier<C> {
    pub fn new(client: C, taxonomy: Taxonomy) -> Self {
        Self { client, taxonomy }
    }
}

impl<C: CompletionClient> Classifier for LlmClassifier<C> {
    fn model(&self) -> &str {
        self.client.model()
    }

    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<ClassifierOutput> {
        let payload = prompt::build_payload(request, &self.taxonomy);
        let user = serde_json::to_string(&payload)?;
        let raw = self.client.complete(&request.instructions.text, &user)?;

        match request.input {
            ClassifierInput::Session { .. } => {
                let (verdict, rationale) = parse::parse_session(&raw, &self.taxonomy)?;
                Ok(ClassifierOutput::Session { verdict, rationale })
            }
            ClassifierInput::Messages { items } => {
                let expected: Vec<i64> = items.iter().map(|i| i.message_id).collect();
                let verdicts = parse::parse_messages(&raw, &self.taxonomy, &expected)?;
                Ok(ClassifierOutput::Messages(verdicts))
            }
        }
    }
}

/// Deterministic verdict for a session whose filtered transcript is empty.
pub fn empty_transcript_verdict(taxonomy: &Taxonomy) -> Verdict {
    Verdict {
        primary_category: taxonomy.fallback().to_string(),
        scores: taxonomy.uniform_scores(),
        primary_score_missing: false,
    }
}
