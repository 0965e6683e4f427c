//! Field escaping for line-oriented, tab-separated metadata files.
//!
//! Backslash, space, tab, and `#` are escaped so that fields survive
//! tab-splitting and comment stripping when the file is read back.

/// Escape a field for storage in a tab-separated line.
#[must_use]
pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        if matches!(c, '\\' | ' ' | '\t' | '#') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Undo [`escape_field`]. A trailing lone backslash is dropped.
#[must_use]
pub fn unescape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}
