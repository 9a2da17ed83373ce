//! Wire protocol shared by the cache adapter and the cache server
//!
//! Header names, the JSON body returned by the cache endpoint, and the
//! naming rules for cache keys, object keys and commit markers.

use serde::{Deserialize, Serialize};

/// Header carrying the orchestrator project that produced an artifact
pub const PROJECT_NAME_HEADER: &str = "x-nx-local-project-name";

/// Header carrying the target (e.g. `build`) that produced an artifact
pub const TARGET_HEADER: &str = "x-nx-local-target";

/// Header carrying the task start time in epoch milliseconds
pub const START_TIME_HEADER: &str = "x-nx-local-start-time";

/// Content type of archive bodies in both directions
pub const ARCHIVE_CONTENT_TYPE: &str = "application/octet-stream";

/// Suffix of the sentinel file written next to a fully extracted artifact
pub const COMMIT_MARKER_SUFFIX: &str = ".commit";

/// Longest accepted hash or project id
pub const MAX_SEGMENT_LEN: usize = 128;

/// Body returned by every cache endpoint response except a successful GET
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheResponse {
    /// Whether the request did what it asked for
    pub ok: bool,
    /// The hash the request was about
    pub id: String,
}

impl CacheResponse {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            ok: true,
            id: id.into(),
        }
    }

    pub fn failed(id: impl Into<String>) -> Self {
        Self {
            ok: false,
            id: id.into(),
        }
    }
}

/// Check that a hash or project id is safe to use as a path segment
///
/// Accepts 1 to [`MAX_SEGMENT_LEN`] ASCII alphanumerics, `-` and `_`. Both
/// sides use the same rule so a key the adapter sends is always a key the
/// server can store.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= MAX_SEGMENT_LEN
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Object storage key for an artifact: `{project_id}/{hash}`
pub fn object_key(project_id: &str, hash: &str) -> String {
    format!("{}/{}", project_id, hash)
}

/// File name of the commit marker for a hash: `{hash}.commit`
pub fn commit_marker_name(hash: &str) -> String {
    format!("{}{}", hash, COMMIT_MARKER_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_ok_response() {
        let json = serde_json::to_string(&CacheResponse::ok("abc123")).unwrap();
        assert_eq!(json, r#"{"ok":true,"id":"abc123"}"#);
    }

    #[test]
    fn test_parse_failed_response() {
        let response: CacheResponse =
            serde_json::from_str(r#"{"ok":false,"id":"doesnotexist"}"#).unwrap();
        assert_eq!(response, CacheResponse::failed("doesnotexist"));
    }

    #[test]
    fn test_valid_segments() {
        assert!(is_valid_segment("abc123"));
        assert!(is_valid_segment("8f2c6a1e-7c1b-4d4f-9a7e-0b9c2d1e3f4a"));
        assert!(is_valid_segment("1234567890_abc"));
    }

    #[test]
    fn test_invalid_segments() {
        assert!(!is_valid_segment(""));
        assert!(!is_valid_segment(".."));
        assert!(!is_valid_segment("a/b"));
        assert!(!is_valid_segment("a.commit"));
        assert!(!is_valid_segment(&"a".repeat(MAX_SEGMENT_LEN + 1)));
    }

    #[test]
    fn test_key_and_marker_names() {
        assert_eq!(object_key("p1", "abc123"), "p1/abc123");
        assert_eq!(commit_marker_name("abc123"), "abc123.commit");
    }
}
