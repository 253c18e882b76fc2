//! Classification pipeline
//!
//! Enumerates candidate sessions once, then classifies each session and its
//! messages, committing results through the [`SessionStore`].
//!
//! ## Architecture
//!
//! ```text
//! SessionStore ──► select_candidates ──► workers (one session each)
//!                                           │
//!                ┌──────────────────────────┴───────────────────────────┐
//!                ▼                                                      ▼
//!         session unit                                          message batches
//!   eligible? ─► classify ─► upsert           assemble ─► batch ─► guard ─► classify ─► upsert
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let pipeline = Pipeline::new(&db, &classifier, provider.as_ref(), &taxonomy, options);
//! let summary = pipeline.run()?;
//! println!("{} messages classified", summary.messages_classified);
//! ```

pub mod batch;
pub mod cursor;
pub mod guard;
mod summary;
pub mod transcript;

pub use batch::batches;
pub use cursor::{select_candidates, SelectionOptions};
pub use guard::{guard, GuardDecision};
pub use summary::RunSummary;
pub use transcript::{assemble, ContentPolicy};

use crate::classifier::{
    empty_transcript_verdict, retry_transient, Classifier, ClassifierInput, ClassifyRequest,
    RetryPolicy, Verdict,
};
use crate::config::{Config, RetryConfig};
use crate::db::{CandidateFilter, SessionStore};
use crate::error::{Error, Result};
use crate::instructions::{InstructionProvider, Instructions};
use crate::taxonomy::Taxonomy;
use crate::types::{
    ClassificationKind, Message, MessageClassification, Role, RoleFilter, SessionClassification,
    SessionRef,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const EMPTY_TRANSCRIPT_NOTE: &str = "empty transcript";
const MISSING_SCORE_NOTE: &str = "primary category had no score; defaulted to 0";

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub classify_sessions: bool,
    pub classify_messages: bool,
    /// Roles included in the session transcript
    pub session_roles: RoleFilter,
    /// Roles eligible for message classification
    pub message_roles: RoleFilter,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    /// Messages per classifier call; `None` sends the whole pool at once
    pub batch_size: Option<usize>,
    pub reclassify_existing_messages: bool,
    pub workers: usize,
    pub content: ContentPolicy,
    /// Backoff for store reads and writes
    pub store_retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            classify_sessions: true,
            classify_messages: true,
            session_roles: RoleFilter::All,
            message_roles: RoleFilter::Only(vec![Role::User]),
            since: None,
            limit: None,
            batch_size: None,
            reclassify_existing_messages: false,
            workers: 1,
            content: ContentPolicy::default(),
            store_retry: RetryPolicy::for_store(&RetryConfig::default()),
        }
    }
}

impl PipelineOptions {
    /// Options seeded from `[pipeline]` and `[retry]`; run flags keep their defaults.
    pub fn from_config(config: &Config) -> Result<Self> {
        let session_roles =
            RoleFilter::from_names(&config.pipeline.session_roles).map_err(Error::Config)?;
        Ok(Self {
            session_roles,
            workers: config.pipeline.workers.max(1),
            content: ContentPolicy {
                max_chars: config.pipeline.max_content_chars,
                first_user_split_marker: config.pipeline.first_user_split_marker.clone(),
            },
            store_retry: RetryPolicy::for_store(&config.retry),
            ..Self::default()
        })
    }

    fn selection(&self) -> SelectionOptions {
        SelectionOptions {
            since: self.since,
            limit: self.limit,
            classify_sessions: self.classify_sessions,
            classify_messages: self.classify_messages,
            reclassify_existing_messages: self.reclassify_existing_messages,
        }
    }
}

/// Why a unit did no work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Stored watermark already covers the session's latest message
    UpToDate,
    /// Every message in the batch already has a row
    AllExisting,
}

/// Result of one unit (a session classification or a message batch)
#[derive(Debug)]
pub enum UnitOutcome {
    Classified,
    Skipped(SkipReason),
    Failed(Error),
}

impl UnitOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, UnitOutcome::Failed(_))
    }
}

/// One message batch
#[derive(Debug)]
pub struct BatchOutcome {
    /// Every message id in the batch, including ones pruned by the guard
    pub message_ids: Vec<i64>,
    /// How many were sent to the classifier
    pub sent: usize,
    pub outcome: UnitOutcome,
}

/// Everything that happened to one session
#[derive(Debug)]
pub struct SessionOutcome {
    pub session_id: String,
    /// `None` when session classification is disabled
    pub session: Option<UnitOutcome>,
    pub batches: Vec<BatchOutcome>,
    pub anomalies: usize,
}

impl SessionOutcome {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            session: None,
            batches: Vec::new(),
            anomalies: 0,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.session.as_ref().is_some_and(UnitOutcome::is_failed)
            || self.batches.iter().any(|b| b.outcome.is_failed())
    }
}

type ProgressFn<'a> = Box<dyn Fn(&SessionOutcome) + Send + Sync + 'a>;

/// Per-run state shared by workers
struct RunState {
    session_instructions: Option<Instructions>,
    message_instructions: Option<Instructions>,
    next: AtomicUsize,
    abort: AtomicBool,
    fatal: Mutex<Option<Error>>,
    summary: Mutex<RunSummary>,
}

/// Runs the classification pipeline against a store and a classifier.
pub struct Pipeline<'a> {
    store: &'a dyn SessionStore,
    classifier: &'a dyn Classifier,
    instructions: &'a dyn InstructionProvider,
    taxonomy: &'a Taxonomy,
    options: PipelineOptions,
    cancel: Option<Arc<AtomicBool>>,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        store: &'a dyn SessionStore,
        classifier: &'a dyn Classifier,
        instructions: &'a dyn InstructionProvider,
        taxonomy: &'a Taxonomy,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            classifier,
            instructions,
            taxonomy,
            options,
            cancel: None,
            progress: None,
        }
    }

    /// Stop at the next session boundary once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Called after each session finishes
    pub fn on_session_done(mut self, f: impl Fn(&SessionOutcome) + Send + Sync + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Candidate sessions this run would process, in processing order.
    pub fn plan(&self) -> Result<Vec<SessionRef>> {
        plan_candidates(self.store, &self.options)
    }

    /// Process every candidate session.
    ///
    /// Per-unit failures are counted in the summary. A fatal failure stops
    /// all workers and is returned as the error.
    pub fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::start();
        let span = tracing::info_span!("run", run_id = %summary.run_id);
        let _enter = span.enter();

        if !self.options.classify_sessions && !self.options.classify_messages {
            tracing::info!("Session and message classification both disabled, nothing to do");
            summary.finish();
            return Ok(summary);
        }

        let session_instructions =
            self.load_instructions(self.options.classify_sessions, ClassificationKind::Session)?;
        let message_instructions =
            self.load_instructions(self.options.classify_messages, ClassificationKind::Message)?;

        let candidates = self.plan()?;
        summary.sessions_considered = candidates.len();
        tracing::info!(
            candidates = candidates.len(),
            workers = self.options.workers,
            model = %self.classifier.model(),
            "Starting classification run"
        );

        let state = RunState {
            session_instructions,
            message_instructions,
            next: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            fatal: Mutex::new(None),
            summary: Mutex::new(summary),
        };

        let workers = self.options.workers.clamp(1, candidates.len().max(1));
        if workers == 1 {
            self.work(&candidates, &state);
        } else {
            std::thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|| self.work(&candidates, &state));
                }
            });
        }

        if let Some(err) = state.fatal.into_inner().unwrap() {
            tracing::error!(error = %err, "Run aborted");
            return Err(err);
        }

        let mut summary = state.summary.into_inner().unwrap();
        if self.is_cancelled() && state.next.load(Ordering::SeqCst) < candidates.len() {
            summary.cancelled = true;
            tracing::warn!("Run cancelled before all sessions were processed");
        }
        summary.finish();
        tracing::info!(
            sessions_classified = summary.sessions_classified,
            sessions_skipped = summary.sessions_skipped,
            sessions_failed = summary.sessions_failed,
            messages_classified = summary.messages_classified,
            messages_skipped = summary.messages_skipped,
            messages_failed = summary.messages_failed,
            anomalies = summary.anomalies,
            "Classification run finished"
        );
        Ok(summary)
    }

    fn load_instructions(
        &self,
        enabled: bool,
        kind: ClassificationKind,
    ) -> Result<Option<Instructions>> {
        if !enabled {
            return Ok(None);
        }
        self.instructions.get_instructions(kind).map(Some)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Worker loop: claim the next session until the list is drained or the run stops
    fn work(&self, candidates: &[SessionRef], state: &RunState) {
        loop {
            if state.abort.load(Ordering::SeqCst) || self.is_cancelled() {
                return;
            }
            let index = state.next.fetch_add(1, Ordering::SeqCst);
            let Some(candidate) = candidates.get(index) else {
                return;
            };

            match self.process_session(candidate, state) {
                Ok(outcome) => {
                    state.summary.lock().unwrap().absorb(&outcome);
                    if let Some(progress) = &self.progress {
                        progress(&outcome);
                    }
                }
                Err(err) => {
                    tracing::error!(
                        session_id = %candidate.session_id,
                        error = %err,
                        "Fatal classifier failure, stopping run"
                    );
                    state.abort.store(true, Ordering::SeqCst);
                    state.fatal.lock().unwrap().get_or_insert(err);
                    return;
                }
            }
        }
    }

    /// Returns `Err` only for failures that must stop the run.
    fn process_session(&self, candidate: &SessionRef, state: &RunState) -> Result<SessionOutcome> {
        let span = tracing::info_span!("session", session_id = %candidate.session_id);
        let _enter = span.enter();
        let mut outcome = SessionOutcome::new(&candidate.session_id);

        let messages = match retry_transient(&self.options.store_retry, "get_messages", || {
            self.store.get_messages(
                &candidate.session_id,
                &RoleFilter::All,
                Some(candidate.current_upto),
            )
        }) {
            Ok(messages) => messages,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read session messages");
                outcome.session = Some(UnitOutcome::Failed(err));
                return Ok(outcome);
            }
        };
        let first_user = transcript::first_user_message_id(&messages);

        if let Some(instructions) = &state.session_instructions {
            let result =
                self.classify_session(candidate, &messages, first_user, instructions, &mut outcome);
            outcome.session = Some(settle(result, || {
                tracing::warn!("Session classification failed")
            })?);
        }

        if let Some(instructions) = &state.message_instructions {
            let pool = assemble(&messages, &self.options.message_roles);
            for batch in batches(&pool, self.options.batch_size) {
                if state.abort.load(Ordering::SeqCst) {
                    break;
                }
                let batch_outcome =
                    self.classify_batch(batch, first_user, instructions, &mut outcome)?;
                outcome.batches.push(batch_outcome);
            }
        }

        tracing::debug!(failed = outcome.has_failures(), "Session done");
        Ok(outcome)
    }

    fn classify_session(
        &self,
        candidate: &SessionRef,
        messages: &[Message],
        first_user: Option<i64>,
        instructions: &Instructions,
        outcome: &mut SessionOutcome,
    ) -> Result<UnitOutcome> {
        let stored = retry_transient(
            &self.options.store_retry,
            "get_existing_session_classification",
            || self.store.get_existing_session_classification(&candidate.session_id),
        )?;
        if !cursor::is_session_eligible(candidate.current_upto, stored.as_ref()) {
            tracing::debug!("Session classification is up to date");
            return Ok(UnitOutcome::Skipped(SkipReason::UpToDate));
        }

        let transcript = assemble(messages, &self.options.session_roles);
        let (verdict, mut notes) = if transcript.is_empty() {
            tracing::info!("Empty transcript, recording fallback category");
            (
                empty_transcript_verdict(self.taxonomy),
                vec![EMPTY_TRANSCRIPT_NOTE.to_string()],
            )
        } else {
            let input = ClassifierInput::Session {
                session_id: candidate.session_id.clone(),
                transcript: self.options.content.session_transcript(&transcript, first_user),
            };
            let (verdict, rationale) = self
                .classifier
                .classify(&ClassifyRequest::new(&input, instructions))?
                .into_session()?;
            (verdict, rationale.into_iter().collect())
        };

        if self.note_anomaly(&verdict, outcome) {
            notes.push(MISSING_SCORE_NOTE.to_string());
        }

        let row = SessionClassification {
            session_id: candidate.session_id.clone(),
            primary_category: verdict.primary_category,
            all_categories: verdict.scores,
            processed_upto: candidate.current_upto,
            run_at: Utc::now(),
            model: self.classifier.model().to_string(),
            instructions_version: Some(instructions.version.clone()),
            notes: if notes.is_empty() {
                None
            } else {
                Some(notes.join("; "))
            },
        };
        retry_transient(&self.options.store_retry, "upsert_session_classification", || {
            self.store.upsert_session_classification(&row)
        })?;

        tracing::info!(
            primary_category = %row.primary_category,
            processed_upto = %row.processed_upto,
            "Session classified"
        );
        Ok(UnitOutcome::Classified)
    }

    /// Returns `Err` only for fatal failures.
    fn classify_batch(
        &self,
        batch: &[&Message],
        first_user: Option<i64>,
        instructions: &Instructions,
        outcome: &mut SessionOutcome,
    ) -> Result<BatchOutcome> {
        let message_ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        let force = self.options.reclassify_existing_messages;

        let existing = if force {
            HashSet::new()
        } else {
            match retry_transient(
                &self.options.store_retry,
                "get_existing_message_classification_ids",
                || self.store.get_existing_message_classification_ids(&message_ids),
            ) {
                Ok(existing) => existing,
                Err(err) => {
                    let outcome = settle(Err(err), || {
                        tracing::warn!(message_ids = ?message_ids, "Failed to read existing classifications")
                    })?;
                    return Ok(BatchOutcome {
                        sent: message_ids.len(),
                        message_ids,
                        outcome,
                    });
                }
            }
        };

        let send_ids = match guard(&message_ids, &existing, force) {
            GuardDecision::SkipAllExisting => {
                tracing::debug!(message_ids = ?message_ids, "All messages already classified, skipping batch");
                return Ok(BatchOutcome {
                    message_ids,
                    sent: 0,
                    outcome: UnitOutcome::Skipped(SkipReason::AllExisting),
                });
            }
            GuardDecision::Send(ids) => ids,
        };

        let to_send: Vec<&Message> = batch
            .iter()
            .copied()
            .filter(|m| send_ids.contains(&m.id))
            .collect();
        let result = self.classify_messages(&to_send, first_user, instructions, outcome);
        let unit = settle(result, || {
            tracing::warn!(message_ids = ?send_ids, "Message batch failed")
        })?;

        Ok(BatchOutcome {
            message_ids,
            sent: send_ids.len(),
            outcome: unit,
        })
    }

    fn classify_messages(
        &self,
        to_send: &[&Message],
        first_user: Option<i64>,
        instructions: &Instructions,
        outcome: &mut SessionOutcome,
    ) -> Result<UnitOutcome> {
        let input = ClassifierInput::Messages {
            items: self.options.content.message_items(to_send, first_user),
        };
        let verdicts = self
            .classifier
            .classify(&ClassifyRequest::new(&input, instructions))?
            .into_messages()?;

        let run_at = Utc::now();
        let model = self.classifier.model().to_string();
        let mut rows = Vec::with_capacity(verdicts.len());
        for item in verdicts {
            let message = to_send
                .iter()
                .find(|m| m.id == item.message_id)
                .ok_or_else(|| {
                    Error::SchemaViolation(format!("unexpected message_id {}", item.message_id))
                })?;
            self.note_anomaly(&item.verdict, outcome);
            rows.push(MessageClassification {
                message_id: message.id,
                session_id: message.session_id.clone(),
                role: message.role.clone(),
                primary_category: item.verdict.primary_category,
                all_categories: item.verdict.scores,
                run_at,
                model: model.clone(),
                instructions_version: Some(instructions.version.clone()),
            });
        }

        retry_transient(&self.options.store_retry, "upsert_message_classifications", || {
            self.store.upsert_message_classifications(&rows)
        })?;
        tracing::info!(count = rows.len(), "Messages classified");
        Ok(UnitOutcome::Classified)
    }

    fn note_anomaly(&self, verdict: &Verdict, outcome: &mut SessionOutcome) -> bool {
        if verdict.primary_score_missing {
            tracing::warn!(
                primary_category = %verdict.primary_category,
                "Model returned a primary category without a score"
            );
            outcome.anomalies += 1;
        }
        verdict.primary_score_missing
    }
}

/// Enumerate and select candidate sessions without classifying anything.
pub fn plan_candidates(
    store: &dyn SessionStore,
    options: &PipelineOptions,
) -> Result<Vec<SessionRef>> {
    let filter = CandidateFilter {
        since: options.since,
        message_roles: options.message_roles.clone(),
    };
    let sessions = retry_transient(&options.store_retry, "list_candidate_sessions", || {
        store.list_candidate_sessions(&filter)
    })?;
    let total = sessions.len();
    let selected = select_candidates(sessions, &options.selection());
    tracing::debug!(
        total_sessions = total,
        candidates = selected.len(),
        "Selected candidate sessions"
    );
    Ok(selected)
}

/// Turn a unit result into an outcome; only fatal errors stay errors.
fn settle(result: Result<UnitOutcome>, log_failure: impl FnOnce()) -> Result<UnitOutcome> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            log_failure();
            let attempts = match &err {
                Error::RetriesExhausted { attempts, .. } => *attempts,
                _ => 1,
            };
            tracing::warn!(error = %err, attempts, "Unit failed");
            Ok(UnitOutcome::Failed(err))
        }
    }
}
