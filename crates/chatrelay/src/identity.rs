//! Identity keys for messaging sessions.
//!
//! Identities arrive from the outside (URL path segments, config) and are
//! used as map keys and as directory names by transport implementations, so
//! they are always sanitized to a bounded alphanumeric token first.

use std::fmt;

/// Maximum length of a sanitized identity.
const MAX_IDENTITY_LEN: usize = 64;

/// Identity used when the supplied key sanitizes to nothing.
const DEFAULT_IDENTITY: &str = "default";

/// Key identifying one logical messaging session / end user.
///
/// Construction goes through [`Identity::sanitize`], so an `Identity` value
/// is always a non-empty token of ASCII alphanumerics, `-` and `_`, at most
/// 64 characters long.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Sanitize an externally supplied key into an identity.
    ///
    /// Characters outside `[A-Za-z0-9_-]` are dropped and the result is
    /// truncated. Input that sanitizes to the empty string collapses to the
    /// default identity.
    pub fn sanitize(raw: &str) -> Self {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            .take(MAX_IDENTITY_LEN)
            .collect();

        if cleaned.is_empty() {
            Self(DEFAULT_IDENTITY.to_string())
        } else {
            Self(cleaned)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_valid_tokens() {
        assert_eq!(Identity::sanitize("user1").as_str(), "user1");
        assert_eq!(Identity::sanitize("team_a-42").as_str(), "team_a-42");
    }

    #[test]
    fn strips_invalid_characters() {
        assert_eq!(Identity::sanitize("user@1").as_str(), "user1");
        assert_eq!(Identity::sanitize("../etc/passwd").as_str(), "etcpasswd");
        assert_eq!(Identity::sanitize("a b\tc").as_str(), "abc");
    }

    #[test]
    fn empty_input_collapses_to_default() {
        assert_eq!(Identity::sanitize("").as_str(), "default");
        assert_eq!(Identity::sanitize("!!!").as_str(), "default");
        assert_eq!(Identity::sanitize("   ").as_str(), "default");
    }

    #[test]
    fn truncates_long_input() {
        let long = "x".repeat(200);
        assert_eq!(Identity::sanitize(&long).as_str().len(), 64);
    }

    #[test]
    fn equal_after_sanitization() {
        assert_eq!(Identity::sanitize("user@1"), Identity::sanitize("user1"));
    }
}
