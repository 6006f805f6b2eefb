/// Default number of characters shown when previewing a chunk.
pub const DEFAULT_PREVIEW_CHARS: usize = 100;

/// Separator between retrieved chunks in a prompt context.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// One-line preview of `text`: whitespace runs collapse to single spaces
/// and the result is cut to `max_chars` characters with a trailing `...`.
///
/// # Examples
///
/// ```
/// use docrag::text_util::preview;
///
/// assert_eq!(preview("a  b\nc", 10), "a b c");
/// assert_eq!(preview("abcdefghij", 4), "abcd...");
/// ```
pub fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &collapsed[..cut]),
        None => collapsed,
    }
}

/// Join retrieved chunk texts into the context block of a prompt.
pub fn join_context<S: AsRef<str>>(chunks: &[S]) -> String {
    chunks
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}
