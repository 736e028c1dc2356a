//! Small helpers shared across modules.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Whether `id` can be used as a file name: 1-128 chars of `[A-Za-z0-9_.-]`,
/// not starting with a dot.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Current timestamp in milliseconds.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_ids() {
        assert!(is_safe_id("3f2a9c1e-7b4d-4e0a-9a51-0c6d2f1b8e77"));
        assert!(is_safe_id("my_session.v2"));
        assert!(!is_safe_id(""));
        assert!(!is_safe_id(".hidden"));
        assert!(!is_safe_id("../up"));
        assert!(!is_safe_id("a/b"));
        assert!(!is_safe_id(&"x".repeat(129)));
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
        assert_eq!(expand_tilde("rel~"), "rel~");
    }
}
