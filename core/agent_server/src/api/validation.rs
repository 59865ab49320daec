//! Request-body validation helpers shared by the HTTP handlers.

use crate::error::AgentServerError;

const MAX_TEXT_FIELD_LEN: usize = 200_000;

/// A required free-text field must be present and non-blank.
pub fn require_text(field: &str, value: &str) -> Result<(), AgentServerError> {
    if value.trim().is_empty() {
        return Err(AgentServerError::InvalidInput(format!(
            "{field} is required"
        )));
    }
    if value.len() > MAX_TEXT_FIELD_LEN {
        return Err(AgentServerError::InvalidInput(format!(
            "{field} exceeds the maximum length of {MAX_TEXT_FIELD_LEN} bytes"
        )));
    }
    Ok(())
}

/// Session ids come from clients; keep them printable and bounded.
pub fn require_session_id(value: &str) -> Result<(), AgentServerError> {
    if value.trim().is_empty() {
        return Err(AgentServerError::InvalidInput(
            "sessionId is required".into(),
        ));
    }
    if value.len() > 128 || value.chars().any(char::is_control) {
        return Err(AgentServerError::InvalidInput(
            "sessionId must be a short printable identifier".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_rejected() {
        assert!(require_text("request", "").is_err());
        assert!(require_text("request", "   ").is_err());
        assert!(require_text("request", "analyze the data").is_ok());
    }

    #[test]
    fn oversized_text_is_rejected() {
        let huge = "x".repeat(MAX_TEXT_FIELD_LEN + 1);
        assert!(require_text("request", &huge).is_err());
    }

    #[test]
    fn session_ids_are_bounded_and_printable() {
        assert!(require_session_id("s1").is_ok());
        assert!(require_session_id("").is_err());
        assert!(require_session_id(&"a".repeat(200)).is_err());
        assert!(require_session_id("bad\nid").is_err());
    }
}
