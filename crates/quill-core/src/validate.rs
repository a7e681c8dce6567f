use crate::errors::CoreError;

pub const TOPIC_MIN_CHARS: usize = 3;
pub const TOPIC_MAX_CHARS: usize = 200;

/// Check a job topic and return it trimmed.
///
/// A topic must be 3..=200 characters after trimming and contain at least one
/// ASCII letter.
pub fn validate_topic(topic: &str) -> Result<String, CoreError> {
    let trimmed = topic.trim();
    let len = trimmed.chars().count();

    if len < TOPIC_MIN_CHARS {
        return Err(CoreError::InvalidInput(format!(
            "topic must be at least {TOPIC_MIN_CHARS} characters"
        )));
    }
    if len > TOPIC_MAX_CHARS {
        return Err(CoreError::InvalidInput(format!(
            "topic must be at most {TOPIC_MAX_CHARS} characters (got {len})"
        )));
    }
    if !trimmed.chars().any(|c| c.is_ascii_alphabetic()) {
        return Err(CoreError::InvalidInput("topic must contain a letter".into()));
    }

    Ok(trimmed.to_string())
}

/// Strip NUL bytes and cap length before text is stored or logged.
pub fn sanitize_text(text: &str, max_chars: usize) -> String {
    text.chars().filter(|&c| c != '\0').take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_trims() {
        assert_eq!(validate_topic("  rust async  ").unwrap(), "rust async");
    }

    #[test]
    fn rejects_short() {
        assert!(validate_topic("ab").is_err());
        assert!(validate_topic("   a  ").is_err());
        assert!(validate_topic("").is_err());
    }

    #[test]
    fn rejects_long() {
        let long = "a".repeat(201);
        assert!(validate_topic(&long).is_err());
        assert!(validate_topic(&"a".repeat(200)).is_ok());
    }

    #[test]
    fn requires_a_letter() {
        let err = validate_topic("12345").unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        assert!(validate_topic("2024 ai").is_ok());
    }

    #[test]
    fn sanitize_drops_nul_and_caps() {
        assert_eq!(sanitize_text("a\0bc", 10), "abc");
        assert_eq!(sanitize_text("abcdef", 3), "abc");
    }
}
