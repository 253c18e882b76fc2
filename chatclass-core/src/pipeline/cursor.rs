//! Watermark and eligibility decisions.
//!
//! Nothing here touches the store; `processed_upto` only moves when the
//! orchestrator commits a session classification.

use crate::types::{Message, SessionClassification, SessionRef};
use chrono::{DateTime, Utc};

/// Max message timestamp
pub fn current_upto(messages: &[Message]) -> Option<DateTime<Utc>> {
    messages.iter().map(|m| m.timestamp).max()
}

/// A session needs (re)classification iff it has never been classified or
/// has messages newer than the stored watermark.
pub fn is_session_eligible(
    current_upto: DateTime<Utc>,
    stored: Option<&SessionClassification>,
) -> bool {
    watermark_behind(current_upto, stored.map(|s| s.processed_upto))
}

/// Inside the `since` window; everything is when `since` is unset
pub fn is_candidate(current_upto: DateTime<Utc>, since: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |since| current_upto >= since)
}

fn watermark_behind(current_upto: DateTime<Utc>, processed_upto: Option<DateTime<Utc>>) -> bool {
    processed_upto.map_or(true, |processed| current_upto > processed)
}

/// Knobs for [`select_candidates`]
#[derive(Debug, Clone, Default)]
pub struct SelectionOptions {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub classify_sessions: bool,
    pub classify_messages: bool,
    pub reclassify_existing_messages: bool,
}

/// Sessions with work due, ordered by id, capped at `limit`.
///
/// Filtering happens before the limit so repeated limited runs walk
/// forward through the backlog instead of revisiting finished sessions.
pub fn select_candidates(sessions: Vec<SessionRef>, options: &SelectionOptions) -> Vec<SessionRef> {
    let mut selected: Vec<SessionRef> = sessions
        .into_iter()
        .filter(|s| is_candidate(s.current_upto, options.since))
        .filter(|s| has_due_work(s, options))
        .collect();
    selected.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    if let Some(limit) = options.limit {
        selected.truncate(limit);
    }
    selected
}

fn has_due_work(session: &SessionRef, options: &SelectionOptions) -> bool {
    let session_due =
        options.classify_sessions && watermark_behind(session.current_upto, session.processed_upto);
    let messages_due = options.classify_messages
        && if options.reclassify_existing_messages {
            session.role_messages > 0
        } else {
            session.unclassified_messages > 0
        };
    session_due || messages_due
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, ScoreMap};
    use chrono::{Duration, TimeZone};

    fn t(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600, 0).unwrap() + Duration::seconds(offset_secs)
    }

    fn stored(processed_upto: DateTime<Utc>) -> SessionClassification {
        SessionClassification {
            session_id: "s".to_string(),
            primary_category: "other".to_string(),
            all_categories: ScoreMap::new(),
            processed_upto,
            run_at: processed_upto,
            model: "m".to_string(),
            instructions_version: None,
            notes: None,
        }
    }

    fn session(id: &str, upto: i64, processed: Option<i64>, role: i64, unclassified: i64) -> SessionRef {
        SessionRef {
            session_id: id.to_string(),
            current_upto: t(upto),
            message_count: role,
            processed_upto: processed.map(t),
            role_messages: role,
            unclassified_messages: unclassified,
        }
    }

    #[test]
    fn test_current_upto() {
        assert_eq!(current_upto(&[]), None);
        let messages: Vec<Message> = [30, 10, 20]
            .iter()
            .enumerate()
            .map(|(i, offset)| Message {
                id: i as i64,
                session_id: "s".to_string(),
                role: Role::User,
                content: None,
                timestamp: t(*offset),
            })
            .collect();
        assert_eq!(current_upto(&messages), Some(t(30)));
    }

    #[test]
    fn test_eligibility_follows_watermark() {
        assert!(is_session_eligible(t(10), None));
        let row = stored(t(10));
        assert!(!is_session_eligible(t(10), Some(&row)));
        assert!(!is_session_eligible(t(5), Some(&row)));
        assert!(is_session_eligible(t(11), Some(&row)));
    }

    #[test]
    fn test_since_window_is_inclusive() {
        assert!(is_candidate(t(0), None));
        assert!(is_candidate(t(10), Some(t(10))));
        assert!(!is_candidate(t(9), Some(t(10))));
    }

    #[test]
    fn test_select_filters_then_orders_then_limits() {
        let sessions = vec![
            session("c", 50, None, 1, 1),
            session("a", 50, Some(50), 2, 0),
            session("b", 50, Some(40), 2, 0),
            session("d", 5, None, 1, 1),
            session("e", 60, Some(60), 1, 1),
        ];
        let options = SelectionOptions {
            since: Some(t(10)),
            limit: Some(2),
            classify_sessions: true,
            classify_messages: true,
            reclassify_existing_messages: false,
        };
        let ids: Vec<String> = select_candidates(sessions, &options)
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        // a is fully done, d is outside the window
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_select_respects_enabled_kinds() {
        let sessions = vec![session("a", 50, Some(50), 2, 0), session("b", 50, Some(40), 2, 0)];

        let messages_only = SelectionOptions {
            classify_messages: true,
            ..Default::default()
        };
        assert!(select_candidates(sessions.clone(), &messages_only).is_empty());

        let reclassify = SelectionOptions {
            classify_messages: true,
            reclassify_existing_messages: true,
            ..Default::default()
        };
        assert_eq!(select_candidates(sessions.clone(), &reclassify).len(), 2);

        let sessions_only = SelectionOptions {
            classify_sessions: true,
            ..Default::default()
        };
        let selected = select_candidates(sessions, &sessions_only);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].session_id, "b");
    }
}
