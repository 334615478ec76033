//! Dot-path key handling.

use crate::error::{ConfigError, Result};

/// Split a dot-path key into its segments, rejecting malformed keys.
pub(crate) fn segments(key: &str) -> Result<Vec<&str>> {
    let reject = |reason| ConfigError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    if key.is_empty() {
        return Err(reject("key is empty"));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(reject("key contains whitespace"));
    }

    let parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(reject("key has an empty path segment"));
    }
    Ok(parts)
}

/// The field group of a key: its first dot-path segment.
pub(crate) fn field_group(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_segments() {
        assert_eq!(segments("server.port").unwrap(), vec!["server", "port"]);
        assert_eq!(segments("flat").unwrap(), vec!["flat"]);
    }

    #[test]
    fn test_malformed_keys() {
        for key in ["", ".a", "a.", "a..b", "a b"] {
            let err = segments(key).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidKey, "key {key:?}");
        }
    }

    #[test]
    fn test_field_group() {
        assert_eq!(field_group("db.pool.size"), "db");
        assert_eq!(field_group("db"), "db");
    }
}
