//! Message file codec
//!
//! Serializes a chat message to the JSON file representation stored under a
//! repository's message path, and decodes files written by any codec version
//! back into a [`Message`]. Pure functions, no I/O.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{Message, MessageId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed message file {path}: {reason}")]
pub struct DecodeError {
    pub path: String,
    pub reason: String,
}

impl DecodeError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// On-disk message layout. Decoding also accepts the legacy layout
/// (numeric `id`, `timestamp` instead of `created_at`, no `author`) and
/// ignores fields added by newer codec versions.
#[derive(Serialize)]
struct MessageFile<'a> {
    id: &'a str,
    content: &'a str,
    author: &'a str,
    created_at: String,
}

#[derive(Deserialize)]
struct RawMessageFile {
    id: Option<serde_json::Value>,
    content: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default, alias = "timestamp")]
    created_at: Option<String>,
}

/// Deterministic repository path for a message: `{message_path}/{id}.json`.
pub fn file_path(message_path: &str, id: &MessageId) -> String {
    format!("{}/{}.json", message_path.trim_matches('/'), id)
}

/// Encode a message as its repository file. Returns the path under the
/// target's message path and the file content.
pub fn encode(message: &Message, message_path: &str) -> (String, Vec<u8>) {
    let file = MessageFile {
        id: message.id.as_str(),
        content: &message.content,
        author: &message.author,
        created_at: message.created_at.to_rfc3339(),
    };
    // Struct-to-JSON serialization of string fields cannot fail
    let bytes = serde_json::to_vec_pretty(&file).unwrap_or_default();
    (file_path(message_path, &message.id), bytes)
}

/// Decode a repository file into a message. The origin target is not part of
/// the file representation; callers stamp it after decoding.
pub fn decode(path: &str, bytes: &[u8]) -> Result<Message, DecodeError> {
    let raw: RawMessageFile =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::new(path, e.to_string()))?;

    let id = match raw.id {
        Some(serde_json::Value::String(id)) => id,
        // Legacy files carried the numeric database id
        Some(serde_json::Value::Number(id)) => id.to_string(),
        Some(other) => {
            return Err(DecodeError::new(path, format!("unsupported id: {other}")));
        }
        None => file_stem(path)
            .ok_or_else(|| DecodeError::new(path, "missing id"))?
            .to_string(),
    };

    let created_at = match raw.created_at {
        Some(ts) => parse_timestamp(&ts)
            .ok_or_else(|| DecodeError::new(path, format!("unparseable timestamp: {ts}")))?,
        None => return Err(DecodeError::new(path, "missing timestamp")),
    };

    Ok(Message {
        id: MessageId::from(id),
        content: raw.content,
        author: raw.author.unwrap_or_else(|| "unknown".to_string()),
        created_at,
        origin: None,
    })
}

fn file_stem(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let stem = name.strip_suffix(".json").unwrap_or(name);
    (!stem.is_empty()).then_some(stem)
}

/// RFC 3339 first, then the zone-less ISO form older writers produced.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
