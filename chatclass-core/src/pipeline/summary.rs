use super::{BatchOutcome, SessionOutcome, UnitOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counts for one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Stopped early by the cancellation flag
    pub cancelled: bool,
    pub sessions_considered: usize,
    pub sessions_classified: usize,
    pub sessions_skipped: usize,
    pub sessions_failed: usize,
    pub batches_classified: usize,
    pub batches_skipped: usize,
    pub batches_failed: usize,
    pub messages_classified: usize,
    /// Skipped because a classification row already existed
    pub messages_skipped: usize,
    pub messages_failed: usize,
    /// Soft anomalies, e.g. a primary category returned without a score
    pub anomalies: usize,
}

impl RunSummary {
    pub fn start() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            cancelled: false,
            sessions_considered: 0,
            sessions_classified: 0,
            sessions_skipped: 0,
            sessions_failed: 0,
            batches_classified: 0,
            batches_skipped: 0,
            batches_failed: 0,
            messages_classified: 0,
            messages_skipped: 0,
            messages_failed: 0,
            anomalies: 0,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Fold one finished session into the totals
    pub fn absorb(&mut self, outcome: &SessionOutcome) {
        match &outcome.session {
            Some(UnitOutcome::Classified) => self.sessions_classified += 1,
            Some(UnitOutcome::Skipped(_)) => self.sessions_skipped += 1,
            Some(UnitOutcome::Failed(_)) => self.sessions_failed += 1,
            None => {}
        }
        for batch in &outcome.batches {
            self.absorb_batch(batch);
        }
        self.anomalies += outcome.anomalies;
    }

    fn absorb_batch(&mut self, batch: &BatchOutcome) {
        let pruned = batch.message_ids.len() - batch.sent;
        self.messages_skipped += pruned;
        match &batch.outcome {
            UnitOutcome::Classified => {
                self.batches_classified += 1;
                self.messages_classified += batch.sent;
            }
            UnitOutcome::Skipped(_) => self.batches_skipped += 1,
            UnitOutcome::Failed(_) => {
                self.batches_failed += 1;
                self.messages_failed += batch.sent;
            }
        }
    }

    pub fn has_failures(&self) -> bool {
        self.sessions_failed > 0 || self.batches_failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SkipReason;
    use crate::Error;

    #[test]
    fn test_absorb_counts_units_and_messages() {
        let mut summary = RunSummary::start();
        summary.absorb(&SessionOutcome {
            session_id: "s1".to_string(),
            session: Some(UnitOutcome::Classified),
            batches: vec![
                BatchOutcome {
                    message_ids: vec![1, 2],
                    sent: 1,
                    outcome: UnitOutcome::Classified,
                },
                BatchOutcome {
                    message_ids: vec![3, 4],
                    sent: 0,
                    outcome: UnitOutcome::Skipped(SkipReason::AllExisting),
                },
                BatchOutcome {
                    message_ids: vec![5],
                    sent: 1,
                    outcome: UnitOutcome::Failed(Error::SchemaViolation("x".to_string())),
                },
            ],
            anomalies: 1,
        });
        summary.absorb(&SessionOutcome {
            session_id: "s2".to_string(),
            session: Some(UnitOutcome::Skipped(SkipReason::UpToDate)),
            batches: vec![],
            anomalies: 0,
        });

        assert_eq!(summary.sessions_classified, 1);
        assert_eq!(summary.sessions_skipped, 1);
        assert_eq!(summary.batches_classified, 1);
        assert_eq!(summary.batches_skipped, 1);
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(summary.messages_classified, 1);
        assert_eq!(summary.messages_skipped, 3);
        assert_eq!(summary.messages_failed, 1);
        assert_eq!(summary.anomalies, 1);
        assert!(summary.has_failures());
    }

    #[test]
    fn test_summary_serializes() {
        let mut summary = RunSummary::start();
        summary.finish();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["sessions_considered"], 0);
        assert_eq!(json["cancelled"], false);
        assert!(json["run_id"].is_string());
        assert!(json["finished_at"].is_string());
    }
}
