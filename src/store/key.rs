//! Key path helpers for the hierarchical namespace.
//!
//! Keys are absolute, `/`-separated paths. Every key handled by the store is
//! normalized first so that `/a//b/` and `/a/b` address the same node.

/// Normalize a key: leading `/`, no trailing `/`, no empty segments.
pub fn normalize(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 1);
    for segment in segments(key) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Iterate the non-empty segments of a key.
pub fn segments(key: &str) -> impl Iterator<Item = &str> {
    key.split('/').filter(|s| !s.is_empty())
}

/// Join a relative path onto a base key.
pub fn join(base: &str, rel: &str) -> String {
    normalize(&format!("{}/{}", base, rel))
}

/// Last segment of a key (`/a/b/c` → `c`). The root yields an empty name.
pub fn base_name(key: &str) -> &str {
    segments(key).last().unwrap_or("")
}

/// Whether `key` equals `prefix` or lies below it.
///
/// Matching is segment-wise: `/hosts/ab` is not within `/hosts/a`.
/// Both arguments must already be normalized.
pub fn is_within(key: &str, prefix: &str) -> bool {
    if prefix == "/" || key == prefix {
        return true;
    }
    key.strip_prefix(prefix)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Segments of `key` below `prefix`, or `None` when `key` is not within it.
pub fn relative<'a>(key: &'a str, prefix: &str) -> Option<Vec<&'a str>> {
    if !is_within(key, prefix) {
        return None;
    }
    let rest = if prefix == "/" { key } else { &key[prefix.len()..] };
    Some(segments(rest).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes() {
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/a//b/"), "/a/b");
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("///"), "/");
    }

    #[test]
    fn prefix_matching_is_segment_wise() {
        assert!(is_within("/hosts/a", "/hosts/a"));
        assert!(is_within("/hosts/a/listeners", "/hosts/a"));
        assert!(!is_within("/hosts/ab", "/hosts/a"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn relative_segments() {
        assert_eq!(
            relative("/proxy/hosts/h1/cert", "/proxy"),
            Some(vec!["hosts", "h1", "cert"])
        );
        assert_eq!(relative("/proxy", "/proxy"), Some(vec![]));
        assert_eq!(relative("/other/x", "/proxy"), None);
        assert_eq!(relative("/x/y", "/"), Some(vec!["x", "y"]));
        assert_eq!(base_name("/a/b/c"), "c");
        assert_eq!(join("/proxy", "hosts/h1"), "/proxy/hosts/h1");
    }
}
