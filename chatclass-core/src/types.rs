//! Core domain types for chatclass
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | A chat conversation thread, the grouping of messages by `session_id` |
//! | **Message** | A single utterance within a session, attributed to a [`Role`] |
//! | **processed_upto** | Session watermark: max message timestamp covered by the stored session classification |
//! | **Unit** | One session-classification call or one message batch |
//!
//! Messages are written by the upstream chat system and are read-only here.
//! The two classification entities are the only rows this crate writes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Category label → score. Ordered so persisted JSON is stable.
pub type ScoreMap = BTreeMap<String, f64>;

// ============================================
// Messages
// ============================================

/// Role of the message author
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    /// Any other role the upstream system emits
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
            Role::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" => Err("empty role".to_string()),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            "system" => Ok(Role::System),
            _ => Ok(Role::Other(normalized)),
        }
    }
}

/// A single message within a session
#[derive(Debug, Clone)]
pub struct Message {
    /// Upstream message ID (unique)
    pub id: i64,
    /// Parent session
    pub session_id: String,
    /// Author role
    pub role: Role,
    /// Text content; tool calls may carry none
    pub content: Option<String>,
    /// When the message was emitted
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Text content or the empty string
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Which roles a transcript or query includes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoleFilter {
    #[default]
    All,
    Only(Vec<Role>),
}

impl RoleFilter {
    /// Build from role names; an empty list means all roles.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        if names.is_empty() {
            return Ok(RoleFilter::All);
        }
        let mut roles = Vec::with_capacity(names.len());
        for name in names {
            let role: Role = name.as_ref().parse()?;
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        Ok(RoleFilter::Only(roles))
    }

    pub fn allows(&self, role: &Role) -> bool {
        match self {
            RoleFilter::All => true,
            RoleFilter::Only(roles) => roles.contains(role),
        }
    }

    /// Role names for SQL `IN (...)`, or `None` for all roles
    pub fn names(&self) -> Option<Vec<&str>> {
        match self {
            RoleFilter::All => None,
            RoleFilter::Only(roles) => Some(roles.iter().map(Role::as_str).collect()),
        }
    }
}

// ============================================
// Sessions
// ============================================

/// A session as seen at candidate-enumeration time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRef {
    pub session_id: String,
    /// Max message timestamp at enumeration time
    pub current_upto: DateTime<Utc>,
    pub message_count: i64,
    /// Watermark of the stored session classification, if any
    pub processed_upto: Option<DateTime<Utc>>,
    /// Messages in the configured message roles
    pub role_messages: i64,
    /// Messages in the configured message roles without a classification row
    pub unclassified_messages: i64,
}

// ============================================
// Classification results
// ============================================

/// Which classifier a unit of work targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    Session,
    Message,
}

impl ClassificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationKind::Session => "session",
            ClassificationKind::Message => "message",
        }
    }
}

impl fmt::Display for ClassificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `session_classification`
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClassification {
    pub session_id: String,
    pub primary_category: String,
    pub all_categories: ScoreMap,
    /// Max message timestamp covered by this classification
    pub processed_upto: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub model: String,
    pub instructions_version: Option<String>,
    /// Model rationale and anomaly notes
    pub notes: Option<String>,
}

/// One row of `message_classification`
#[derive(Debug, Clone, PartialEq)]
pub struct MessageClassification {
    pub message_id: i64,
    pub session_id: String,
    pub role: Role,
    pub primary_category: String,
    pub all_categories: ScoreMap,
    pub run_at: DateTime<Utc>,
    pub model: String,
    pub instructions_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!(" Assistant ".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!(
            "function".parse::<Role>().unwrap(),
            Role::Other("function".to_string())
        );
        assert!("".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_filter() {
        let filter = RoleFilter::from_names(&["user", "USER", "tool"]).unwrap();
        assert_eq!(filter, RoleFilter::Only(vec![Role::User, Role::Tool]));
        assert!(filter.allows(&Role::User));
        assert!(!filter.allows(&Role::Assistant));
        assert_eq!(filter.names(), Some(vec!["user", "tool"]));

        let all = RoleFilter::from_names::<&str>(&[]).unwrap();
        assert!(all.allows(&Role::Other("x".to_string())));
        assert_eq!(all.names(), None);
    }

    #[test]
    fn test_role_round_trip_str() {
        for role in [Role::User, Role::Assistant, Role::Tool, Role::System] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }
}
