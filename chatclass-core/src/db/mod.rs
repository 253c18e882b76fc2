//! Database layer for chatclass
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries and upserts
//! - The [`SessionStore`] seam the pipeline is written against

pub mod repo;
pub mod schema;

pub use repo::Database;

use crate::error::Result;
use crate::types::{
    Message, MessageClassification, RoleFilter, SessionClassification, SessionRef,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Filter for candidate session enumeration
#[derive(Debug, Default, Clone)]
pub struct CandidateFilter {
    /// Only sessions whose latest message is at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Roles counted for `SessionRef::role_messages` / `unclassified_messages`
    pub message_roles: RoleFilter,
}

/// Read/write access the pipeline needs from persistence.
///
/// Implementations must be safe to share across worker threads; writes for
/// the same key resolve last-writer-wins.
pub trait SessionStore: Send + Sync {
    /// Sessions matching `filter`, ordered by session id ascending
    fn list_candidate_sessions(&self, filter: &CandidateFilter) -> Result<Vec<SessionRef>>;

    /// Messages of a session in chronological order, optionally capped at `upto`
    fn get_messages(
        &self,
        session_id: &str,
        roles: &RoleFilter,
        upto: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    fn get_existing_session_classification(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionClassification>>;

    /// Subset of `message_ids` that already have a classification row
    fn get_existing_message_classification_ids(&self, message_ids: &[i64])
        -> Result<HashSet<i64>>;

    fn upsert_session_classification(&self, row: &SessionClassification) -> Result<()>;

    /// Upsert all rows in one transaction
    fn upsert_message_classifications(&self, rows: &[MessageClassification]) -> Result<()>;
}
