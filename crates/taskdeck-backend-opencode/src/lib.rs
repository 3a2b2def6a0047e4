//! OpenCode HTTP backend: server discovery plus the session bridge.

mod bridge;
mod locator;
mod wire;

pub use bridge::OpenCodeBridge;
pub use locator::{
    CommandLauncher, EmbeddedProcess, LocatorConfig, ServerLauncher, ServerLocator,
    DEFAULT_BASE_URL,
};

const MAX_ERROR_BODY_CHARS: usize = 240;

/// Collapses whitespace and control characters and truncates to a bounded
/// number of characters for logs and error messages.
pub(crate) fn sanitize_error_body(body: &str) -> String {
    let sanitized = body
        .chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    match sanitized.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}...", &sanitized[..cut]),
        None => sanitized,
    }
}

#[cfg(test)]
mod tests {
    use super::sanitize_error_body;

    #[test]
    fn sanitize_error_body_collapses_control_characters() {
        assert_eq!(
            sanitize_error_body("bad\r\nrequest\t\u{0}  body"),
            "bad request body"
        );
    }

    #[test]
    fn sanitize_error_body_truncates_on_char_boundaries() {
        let body = "é".repeat(300);
        let sanitized = sanitize_error_body(&body);
        assert!(sanitized.ends_with("..."));
        assert_eq!(sanitized.chars().count(), 243);

        let short = "x".repeat(240);
        assert_eq!(sanitize_error_body(&short), short);
    }
}
