//! Canonical indentation and line-ending normalization.
//!
//! Only whitespace that cannot carry token meaning is rewritten: tabs inside a
//! line's leading whitespace and the line terminators themselves. Everything
//! after the first non-blank character is left byte-for-byte intact, so tabs in
//! string literals survive.

use std::borrow::Cow;

/// Normalize `text` to LF line endings with space-only leading indentation.
///
/// Each tab in the leading whitespace becomes `indent_width` spaces. The output
/// is a fixed point: `normalize_source(normalize_source(t, w), w) == normalize_source(t, w)`.
pub fn normalize_source(text: &str, indent_width: usize) -> String {
    let unified = unify_line_endings(text);
    let mut out = String::with_capacity(unified.len());
    for segment in unified.split_inclusive('\n') {
        let (line, newline) = match segment.strip_suffix('\n') {
            Some(line) => (line, "\n"),
            None => (segment, ""),
        };
        out.push_str(&expand_leading_tabs(line, indent_width));
        out.push_str(newline);
    }
    out
}

/// Replace tabs in the leading whitespace of a single line.
pub fn expand_leading_tabs(line: &str, indent_width: usize) -> Cow<'_, str> {
    let indent_len = line
        .char_indices()
        .find(|(_, c)| *c != ' ' && *c != '\t')
        .map_or(line.len(), |(idx, _)| idx);
    let (indent, rest) = line.split_at(indent_len);
    if !indent.contains('\t') {
        return Cow::Borrowed(line);
    }
    let spaces = " ".repeat(indent_width);
    let mut expanded = indent.replace('\t', &spaces);
    expanded.push_str(rest);
    Cow::Owned(expanded)
}

fn unify_line_endings(text: &str) -> Cow<'_, str> {
    if !text.contains('\r') {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
}
