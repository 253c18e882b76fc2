//! User payloads sent alongside the instruction text.

use super::{ClassifierInput, ClassifyRequest};
use crate::taxonomy::Taxonomy;
use serde_json::{json, Map, Value};

const STRICT_REMINDER: &str = "Your previous reply did not match the schema. \
Reply with exactly one JSON object matching `schema` and nothing else. \
Use only labels listed in `categories`.";

pub(crate) fn build_payload(request: &ClassifyRequest<'_>, taxonomy: &Taxonomy) -> Value {
    let mut payload = match request.input {
        ClassifierInput::Session {
            session_id,
            transcript,
        } => {
            let messages: Vec<Value> = transcript
                .iter()
                .map(|entry| {
                    json!({
                        "role": entry.role.as_str(),
                        "content": entry.content,
                        "timestamp": crate::db::repo::format_ts(&entry.timestamp),
                    })
                })
                .collect();
            json!({
                "task": "single-label session classification",
                "session_id": session_id,
                "categories": taxonomy.categories(),
                "schema": {
                    "session_id": "str",
                    "primary_category": "str",
                    "scores": score_schema(taxonomy),
                    "rationale": "str (<= 2 sentences)",
                },
                "messages": messages,
                "instructions": format!(
                    "Decide the category that best represents the customer's overall intent \
                     across this session. Favor the user's messages over assistant and tool \
                     content. If mixed, choose the dominant or final resolved intent. \
                     Use '{}' when unclear.",
                    taxonomy.fallback()
                ),
            })
        }
        ClassifierInput::Messages { items } => {
            let items: Vec<Value> = items
                .iter()
                .map(|item| json!({ "message_id": item.message_id, "text": item.text }))
                .collect();
            json!({
                "task": "single-label classification per message",
                "categories": taxonomy.categories(),
                "schema": {
                    "items": [{
                        "message_id": "int",
                        "primary_category": "str",
                        "scores": score_schema(taxonomy),
                    }],
                },
                "items": items,
                "instructions": format!(
                    "Assign exactly one primary_category to each message and return one entry \
                     per message_id. Provide a probability-like score for every category that \
                     sums to about 1. Focus on the user's intent. If the text is off-topic or \
                     unclear, use '{}'.",
                    taxonomy.fallback()
                ),
            })
        }
    };

    if request.strict {
        if let Value::Object(map) = &mut payload {
            map.insert("strict_output".to_string(), Value::from(STRICT_REMINDER));
        }
    }
    payload
}

fn score_schema(taxonomy: &Taxonomy) -> Value {
    let map: Map<String, Value> = taxonomy
        .categories()
        .iter()
        .map(|c| (c.clone(), Value::from("float in [0,1]")))
        .collect();
    Value::Object(map)
}
