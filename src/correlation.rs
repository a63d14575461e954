//! Correlation identity — the identifier stamped onto issued sessions so
//! the cloud provider's audit trail can be joined back to a Sentinel
//! decision log entry (spec §3 "Correlation identity").
//!
//! Format: `sentinel:<sanitized-user>:<request-id>`. Sanitization collapses
//! any character outside `[A-Za-z0-9_-]` to `_` and truncates so the whole
//! string fits 64 characters (the cloud provider's `SourceIdentity` length
//! limit).

use crate::id;

const PREFIX: &str = "sentinel";
const MAX_LEN: usize = 64;

/// Sanitize a user identifier for inclusion in a correlation identity:
/// collapse disallowed characters to `_`.
#[must_use]
pub fn sanitize_user(user: &str) -> String {
    user.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the correlation identity `sentinel:<sanitized-user>:<request-id>`,
/// truncating the sanitized user so the full string fits [`MAX_LEN`]
/// characters (spec §3 invariant).
#[must_use]
pub fn format(user: &str, request_id: &str) -> String {
    let sanitized = sanitize_user(user);
    // Reserve room for "sentinel:" + ":" + the 16-hex request id.
    let fixed_len = PREFIX.len() + 2 + request_id.len();
    let budget = MAX_LEN.saturating_sub(fixed_len);
    let truncated: String = sanitized.chars().take(budget).collect();
    format!("{PREFIX}:{truncated}:{request_id}")
}

/// Decompose a correlation identity back into `(sanitized_user, request_id)`.
///
/// Returns `None` if `value` does not have the `sentinel:<user>:<id>` shape
/// or the trailing segment is not a valid 16-hex identifier.
#[must_use]
pub fn parse(value: &str) -> Option<(String, String)> {
    let rest = value.strip_prefix(PREFIX)?.strip_prefix(':')?;
    let (user, request_id) = rest.rsplit_once(':')?;
    if !id::is_valid(request_id) {
        return None;
    }
    Some((user.to_string(), request_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_disallowed_chars() {
        assert_eq!(sanitize_user("alice@example.com"), "alice_example_com");
        assert_eq!(sanitize_user("bob_the-builder"), "bob_the-builder");
    }

    #[test]
    fn format_produces_expected_shape() {
        let request_id = "0123456789abcdef";
        let formatted = format("alice", request_id);
        assert_eq!(formatted, "sentinel:alice:0123456789abcdef");
    }

    #[test]
    fn format_truncates_long_users_to_fit_64_chars() {
        let user = "a".repeat(200);
        let request_id = "0123456789abcdef";
        let formatted = format(&user, request_id);
        assert!(formatted.len() <= 64, "len={}", formatted.len());
        assert!(formatted.starts_with("sentinel:"));
        assert!(formatted.ends_with(request_id));
    }

    #[test]
    fn parse_round_trips_format() {
        let request_id = "0123456789abcdef";
        let formatted = format("alice@example.com", request_id);
        let (user, parsed_id) = parse(&formatted).unwrap();
        assert_eq!(user, "alice_example_com");
        assert_eq!(parsed_id, request_id);
    }

    #[test]
    fn parse_rejects_missing_prefix() {
        assert!(parse("notsentinel:alice:0123456789abcdef").is_none());
    }

    #[test]
    fn parse_rejects_invalid_request_id() {
        assert!(parse("sentinel:alice:not-hex").is_none());
    }

    #[test]
    fn parse_handles_colons_in_sanitized_user() {
        // Sanitized users never contain ':' themselves, but rsplit_once
        // guards against any unexpected extra separators robustly.
        let request_id = "0123456789abcdef";
        let formatted = format("weird:user", request_id);
        let (user, parsed_id) = parse(&formatted).unwrap();
        assert_eq!(user, "weird_user");
        assert_eq!(parsed_id, request_id);
    }
}
