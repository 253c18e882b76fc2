//! Model reply validation.
//!
//! Anything that does not fit the taxonomy or the expected shape is a
//! [`Error::SchemaViolation`]; the retry layer decides what to do with it.

use super::{MessageVerdict, Verdict};
use crate::taxonomy::Taxonomy;
use crate::types::ScoreMap;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

pub(crate) fn parse_session(raw: &str, taxonomy: &Taxonomy) -> Result<(Verdict, Option<String>)> {
    let parsed = parse_object(raw)?;
    let verdict = parse_verdict(&parsed, taxonomy)?;
    let rationale = parsed
        .get("rationale")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);
    Ok((verdict, rationale))
}

/// Parse a batch reply. Every sent id must come back exactly once; the
/// result is returned in `expected` order.
pub(crate) fn parse_messages(
    raw: &str,
    taxonomy: &Taxonomy,
    expected: &[i64],
) -> Result<Vec<MessageVerdict>> {
    let parsed = parse_object(raw)?;
    let items = parsed
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| schema("reply is missing the `items` array"))?;

    let mut by_id: HashMap<i64, Verdict> = HashMap::with_capacity(items.len());
    for item in items {
        let id = parse_message_id(item)?;
        if !expected.contains(&id) {
            return Err(schema(format!("reply contains unknown message_id {id}")));
        }
        let verdict = parse_verdict(item, taxonomy)?;
        if by_id.insert(id, verdict).is_some() {
            return Err(schema(format!("reply contains message_id {id} twice")));
        }
    }

    if by_id.len() != expected.len() {
        return Err(schema(format!(
            "reply covers {} of {} messages",
            by_id.len(),
            expected.len()
        )));
    }

    expected
        .iter()
        .map(|id| {
            by_id
                .remove(id)
                .map(|verdict| MessageVerdict {
                    message_id: *id,
                    verdict,
                })
                .ok_or_else(|| schema(format!("reply is missing message_id {id}")))
        })
        .collect()
}

fn parse_object(raw: &str) -> Result<Value> {
    let parsed = match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(_) => {
            let extracted = extract_json_object(raw)?;
            serde_json::from_str::<Value>(extracted)
                .map_err(|e| schema(format!("reply is not valid JSON: {e}")))?
        }
    };

    if !parsed.is_object() {
        return Err(schema("reply must be a JSON object"));
    }
    Ok(parsed)
}

/// Slice from the first `{` to the last `}`; tolerates prose or code fences
/// around the object.
fn extract_json_object(raw: &str) -> Result<&str> {
    let start = raw
        .find('{')
        .ok_or_else(|| schema("reply did not contain a JSON object"))?;
    let end = raw
        .rfind('}')
        .ok_or_else(|| schema("reply did not contain a JSON object"))?;
    if end <= start {
        return Err(schema("reply JSON bounds are invalid"));
    }
    Ok(&raw[start..=end])
}

fn parse_message_id(item: &Value) -> Result<i64> {
    match item.get("message_id") {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| schema(format!("message_id {n} is not an integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| schema(format!("message_id '{s}' is not an integer"))),
        _ => Err(schema("item is missing message_id")),
    }
}

fn parse_verdict(obj: &Value, taxonomy: &Taxonomy) -> Result<Verdict> {
    let primary = obj
        .get("primary_category")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| schema("missing primary_category"))?;
    if !taxonomy.contains(primary) {
        return Err(schema(format!("category '{primary}' is not in the taxonomy")));
    }

    let mut scores = ScoreMap::new();
    match obj.get("scores") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (label, value) in map {
                if !taxonomy.contains(label) {
                    return Err(schema(format!(
                        "score label '{label}' is not in the taxonomy"
                    )));
                }
                let score = value
                    .as_f64()
                    .filter(|s| s.is_finite())
                    .ok_or_else(|| schema(format!("score for '{label}' is not a number")))?;
                scores.insert(label.clone(), score);
            }
        }
        Some(_) => return Err(schema("scores must be an object")),
    }

    let primary_score_missing = !scores.contains_key(primary);
    if primary_score_missing {
        scores.insert(primary.to_string(), 0.0);
    }

    Ok(Verdict {
        primary_category: primary.to_string(),
        scores,
        primary_score_missing,
    })
}

fn schema(message: impl Into<String>) -> Error {
    Error::SchemaViolation(message.into())
}
