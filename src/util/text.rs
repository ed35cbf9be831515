//! Text helpers shared by tools and renderers.

/// Truncate to at most `max_bytes` without splitting a UTF-8 code point.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate and append a marker noting how many bytes were dropped.
pub fn truncate_with_notice(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let kept = truncate_utf8(s, max_bytes);
    format!(
        "{kept}\n... [truncated {} of {} bytes]",
        s.len() - kept.len(),
        s.len()
    )
}
