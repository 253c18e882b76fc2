//! Role-filtered, chronologically ordered message sequences and the text
//! actually sent to the model.

use crate::classifier::{MessageItem, TranscriptEntry};
use crate::types::{Message, Role, RoleFilter};

/// Messages whose role is allowed, ordered by timestamp then id.
pub fn assemble<'a>(messages: &'a [Message], roles: &RoleFilter) -> Vec<&'a Message> {
    let mut selected: Vec<&Message> = messages.iter().filter(|m| roles.allows(&m.role)).collect();
    selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    selected
}

/// Id of the session's first user message that carries text
pub fn first_user_message_id(messages: &[Message]) -> Option<i64> {
    messages
        .iter()
        .filter(|m| m.role == Role::User && m.content.is_some())
        .min_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)))
        .map(|m| m.id)
}

/// How message text is cleaned before it is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentPolicy {
    /// Per-message cap in characters; 0 disables truncation
    pub max_chars: usize,
    /// Strip everything through this marker in the first user message
    pub first_user_split_marker: Option<String>,
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            first_user_split_marker: None,
        }
    }
}

impl ContentPolicy {
    pub fn text_for(&self, message: &Message, first_user_id: Option<i64>) -> String {
        let mut text = message.text();
        if first_user_id == Some(message.id) {
            if let Some(marker) = self.first_user_split_marker.as_deref() {
                text = strip_through_marker(text, marker);
            }
        }
        truncate_chars(text, self.max_chars).to_string()
    }

    pub fn session_transcript(
        &self,
        messages: &[&Message],
        first_user_id: Option<i64>,
    ) -> Vec<TranscriptEntry> {
        messages
            .iter()
            .map(|m| TranscriptEntry {
                role: m.role.clone(),
                content: self.text_for(m, first_user_id),
                timestamp: m.timestamp,
            })
            .collect()
    }

    pub fn message_items(&self, messages: &[&Message], first_user_id: Option<i64>) -> Vec<MessageItem> {
        messages
            .iter()
            .map(|m| MessageItem {
                message_id: m.id,
                text: self.text_for(m, first_user_id),
            })
            .collect()
    }
}

fn strip_through_marker<'a>(text: &'a str, marker: &str) -> &'a str {
    if marker.is_empty() {
        return text;
    }
    match text.split_once(marker) {
        Some((_, rest)) => rest.trim(),
        None => text,
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return text;
    }
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600, 0).unwrap() + Duration::seconds(offset_secs)
    }

    fn msg(id: i64, role: Role, offset: i64, content: &str) -> Message {
        Message {
            id,
            session_id: "s1".to_string(),
            role,
            content: Some(content.to_string()),
            timestamp: t(offset),
        }
    }

    #[test]
    fn test_assemble_filters_roles_and_orders() {
        let messages = vec![
            msg(3, Role::User, 20, "later"),
            msg(1, Role::User, 10, "first"),
            msg(2, Role::Assistant, 15, "reply"),
            msg(0, Role::User, 10, "tie"),
        ];

        let users = assemble(&messages, &RoleFilter::Only(vec![Role::User]));
        let ids: Vec<i64> = users.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![0, 1, 3]);

        let all = assemble(&messages, &RoleFilter::All);
        let ids: Vec<i64> = all.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_split_marker_applies_to_first_user_message_only() {
        let messages = vec![
            msg(1, Role::System, 0, "setup ### ignored"),
            msg(2, Role::User, 5, "template text ### real question"),
            msg(3, Role::User, 9, "another ### kept"),
        ];
        let policy = ContentPolicy {
            max_chars: 0,
            first_user_split_marker: Some("###".to_string()),
        };
        let first = first_user_message_id(&messages);
        assert_eq!(first, Some(2));

        let refs = assemble(&messages, &RoleFilter::All);
        let transcript = policy.session_transcript(&refs, first);
        assert_eq!(transcript[0].content, "setup ### ignored");
        assert_eq!(transcript[1].content, "real question");
        assert_eq!(transcript[2].content, "another ### kept");
    }

    #[test]
    fn test_truncation_is_char_boundary_safe() {
        let message = msg(1, Role::User, 0, "héllo wörld");
        let policy = ContentPolicy {
            max_chars: 4,
            first_user_split_marker: None,
        };
        assert_eq!(policy.text_for(&message, None), "héll");
    }

    #[test]
    fn test_missing_content_becomes_empty_text() {
        let mut message = msg(1, Role::Tool, 0, "");
        message.content = None;
        let items = ContentPolicy::default().message_items(&[&message], None);
        assert_eq!(items[0].text, "");
        assert_eq!(items[0].message_id, 1);
    }
}
