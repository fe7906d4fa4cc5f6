//! Agent reply contract.
//!
//! Every routed agent reply must embed a JSON object carrying a `decisions`
//! map, optionally with a `content` string. The object may sit anywhere in
//! free text; later objects win over earlier braces used in prose.

use serde_json::{Map, Value};
use thiserror::Error;

use conclave_core::types::{decisions_from_json, Decisions, ParsedAgentResponse};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResponseError {
    #[error("reply is empty")]
    Empty,

    #[error("reply contains no JSON object with a \"decisions\" object (reply starts: {preview:?})")]
    MissingDecisions { preview: String },
}

/// A JSON object found in the reply, with its byte span.
struct Candidate {
    object: Map<String, Value>,
    start: usize,
    end: usize,
}

/// Strict parse used for routing: a `decisions` object is mandatory.
pub fn parse_strict(raw: &str) -> Result<ParsedAgentResponse, ResponseError> {
    if raw.trim().is_empty() {
        return Err(ResponseError::Empty);
    }

    let found = candidates_from_right(raw).find_map(|c| {
        let decisions = match c.object.get("decisions") {
            Some(Value::Object(d)) => decisions_from_json(d),
            _ => return None,
        };
        Some((decisions, c))
    });

    let Some((decisions, candidate)) = found else {
        return Err(ResponseError::MissingDecisions {
            preview: preview(raw, 120),
        });
    };

    Ok(ParsedAgentResponse {
        content: content_for(raw, &candidate),
        decisions,
    })
}

/// Permissive parse for informational calls. Never fails.
///
/// Falls back to the right-most JSON object of any shape (its `content`, or
/// its JSON text) and then to the raw reply, always with empty decisions.
pub fn parse_lenient(raw: &str) -> ParsedAgentResponse {
    if let Ok(parsed) = parse_strict(raw) {
        return parsed;
    }

    match candidates_from_right(raw).next() {
        Some(candidate) => {
            let decisions = match candidate.object.get("decisions") {
                Some(Value::Object(d)) => decisions_from_json(d),
                _ => Decisions::new(),
            };
            let content = match candidate.object.get("content") {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
                _ => None,
            };
            let content = content.unwrap_or_else(|| Value::Object(candidate.object).to_string());
            ParsedAgentResponse { content, decisions }
        }
        None => ParsedAgentResponse {
            content: raw.to_string(),
            decisions: Decisions::new(),
        },
    }
}

/// Decode a JSON object at every `{`, right-most first.
fn candidates_from_right(raw: &str) -> impl Iterator<Item = Candidate> + '_ {
    raw.match_indices('{')
        .map(|(pos, _)| pos)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .filter_map(move |start| {
            let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(Value::Object(object))) => Some(Candidate {
                    object,
                    start,
                    end: start + stream.byte_offset(),
                }),
                _ => None,
            }
        })
}

fn content_for(raw: &str, candidate: &Candidate) -> String {
    if let Some(Value::String(s)) = candidate.object.get("content") {
        if !s.trim().is_empty() {
            return s.clone();
        }
    }

    let mut remainder = String::with_capacity(raw.len());
    remainder.push_str(&raw[..candidate.start]);
    remainder.push_str(&raw[candidate.end..]);
    let remainder = strip_code_fence(remainder.trim());
    if remainder.is_empty() {
        raw.to_string()
    } else {
        remainder.to_string()
    }
}

/// Agents often wrap the decision object in a fenced block; drop the empty fence left behind.
fn strip_code_fence(text: &str) -> &str {
    let Some(body) = text.strip_suffix("```") else {
        return text;
    };
    let body = body.trim_end();
    for opener in ["```json", "```JSON", "```"] {
        if let Some(rest) = body.strip_suffix(opener) {
            return rest.trim_end();
        }
    }
    text
}

/// First `max_chars` characters of `text`, single line.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text.trim().chars().take(max_chars).collect();
    let flat = flat.replace('\n', " ");
    if text.trim().chars().count() > max_chars {
        format!("{}...", flat)
    } else {
        flat
    }
}
