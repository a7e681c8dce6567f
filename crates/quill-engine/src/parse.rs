use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("reply is empty")]
    Empty,

    #[error("reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("unexpected reply shape: {0}")]
    Shape(String),
}

/// Parse a model reply that is supposed to be JSON.
///
/// Tolerates a surrounding markdown code fence and prose around a single
/// top-level object.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let trimmed = strip_fence(text.trim());
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(first) => match embedded_object(trimmed) {
            Some(slice) => serde_json::from_str(slice).map_err(|e| ParseError::InvalidJson(e.to_string()))?,
            None => return Err(ParseError::InvalidJson(first.to_string())),
        },
    };

    serde_json::from_value(value).map_err(|e| ParseError::Shape(e.to_string()))
}

/// Use the parsed value, or fall back and say so in the log.
pub fn or_fallback<T>(parsed: Result<T, ParseError>, task: &str, fallback: impl FnOnce() -> T) -> T {
    match parsed {
        Ok(v) => v,
        Err(e) => {
            warn!(task, error = %e, "reply not usable, using fallback");
            fallback()
        }
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (```json) up to the first newline.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn embedded_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
