//! Glob matching over forward-slash relative paths.
//!
//! Patterns without `**` use single-segment shell globbing, so `*` does not
//! cross `/`. `**/` and a trailing `**` match zero or more path segments.
//! Patterns containing more than one `**` fall back to matching the
//! basename against the pattern with every `**/` removed. The fallback is
//! deliberately loose; directory discovery and event filtering both rely
//! on these exact semantics.

use glob::{MatchOptions, Pattern};

const SEGMENT_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn segment_match(pattern: &str, path: &str) -> bool {
    Pattern::new(pattern)
        .map(|p| p.matches_with(path, SEGMENT_OPTIONS))
        .unwrap_or(false)
}

/// Returns true if `path` matches `pattern`.
///
/// `path` must be relative and use `/` separators. Pure and total: an
/// invalid pattern simply matches nothing.
pub fn matches(path: &str, pattern: &str) -> bool {
    if !pattern.contains("**") {
        return segment_match(pattern, path);
    }

    let parts: Vec<&str> = pattern.split("**/").collect();
    match parts.len() {
        // Trailing `**`, e.g. `vendor/**`: plain prefix match.
        1 => {
            let prefix = parts[0].strip_suffix("**").unwrap_or(parts[0]);
            path.starts_with(prefix)
        }
        // A single `**/`, e.g. `**/*.go` or `src/**/*.css`.
        2 => {
            let prefix = parts[0];
            let suffix = parts[1];

            if !prefix.is_empty() && !path.starts_with(prefix) {
                return false;
            }

            let mut remainder = path;
            if !prefix.is_empty() {
                remainder = remainder.strip_prefix(prefix).unwrap_or(remainder);
                remainder = remainder.strip_prefix('/').unwrap_or(remainder);
            }

            if suffix.is_empty() {
                return true;
            }

            // Left-to-right greedy: try every tail of the remaining path.
            let segments: Vec<&str> = remainder.split('/').collect();
            for start in 0..segments.len() {
                if segment_match(suffix, &segments[start..].join("/")) {
                    return true;
                }
            }
            segment_match(suffix, remainder)
        }
        // Multiple `**`: match the basename against the elided pattern.
        _ => {
            let elided = pattern.replace("**/", "");
            let basename = path.rsplit('/').next().unwrap_or(path);
            segment_match(&elided, basename)
        }
    }
}
