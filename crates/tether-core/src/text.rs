//! Text helpers shared by the decoder, the executor and log output.
//!
//! All truncation here is UTF-8 safe: nothing ever slices through a
//! multi-byte character.

/// Largest byte index `<= index` that sits on a character boundary.
///
/// # Examples
///
/// ```
/// use tether_core::floor_char_boundary;
///
/// let s = "ab\u{e9}c"; // é occupies bytes 2..4
/// assert_eq!(floor_char_boundary(s, 3), 2);
/// assert_eq!(floor_char_boundary(s, 4), 4);
/// assert_eq!(floor_char_boundary(s, 99), s.len());
/// ```
#[must_use]
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut boundary = index;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

/// Truncates to `max_chars` characters, appending "..." when anything was cut.
///
/// # Examples
///
/// ```
/// use tether_core::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &s[..byte_idx]),
        None => s.to_string(),
    }
}

/// Decodes captured process output, keeping at most `max_bytes` of it.
///
/// Returns the text and whether anything was dropped.
pub fn lossy_bounded(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_bytes {
        return (text.into_owned(), false);
    }
    let cut = floor_char_boundary(&text, max_bytes);
    (text[..cut].to_string(), true)
}
