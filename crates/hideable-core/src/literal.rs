//! SQL string literal escaping with binary fallback.
//!
//! Ordinary text is only quote-doubled so stored data stays readable. Values
//! that SQL text cannot carry as-is (anything containing NUL) and values that
//! would be mistaken for encoded data (anything starting with the sentinel)
//! go through [`encode_binary`] first.

use std::borrow::Cow;

use crate::codec::{CodecError, QUOTE, SENTINEL, decode_binary, encode_binary};

/// Double every apostrophe, the way SQL escapes quotes inside a literal.
///
/// # Examples
///
/// ```
/// use hideable_core::literal::double_quotes;
///
/// assert_eq!(double_quotes(b"it's"), b"it''s");
/// ```
pub fn double_quotes(input: &[u8]) -> Vec<u8> {
    let quotes = input.iter().filter(|&&b| b == QUOTE).count();
    let mut out = Vec::with_capacity(input.len() + quotes);
    for &b in input {
        out.push(b);
        if b == QUOTE {
            out.push(QUOTE);
        }
    }
    out
}

/// Collapse doubled apostrophes, the way the engine reads a literal back.
pub fn undouble_quotes(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        out.push(input[i]);
        if input[i] == QUOTE && input.get(i + 1) == Some(&QUOTE) {
            i += 2;
        } else {
            i += 1;
        }
    }
    out
}

/// Returns true if `input` has to be binary-encoded before it can be
/// stored in a literal.
pub fn needs_binary_encoding(input: &[u8]) -> bool {
    input.first() == Some(&SENTINEL) || input.contains(&0)
}

/// Escape bytes for interpolation between apostrophes in SQL text.
///
/// Plain text is returned quote-doubled. Input that starts with the
/// sentinel or contains NUL is binary-encoded first.
pub fn escape_for_literal(input: &[u8]) -> Vec<u8> {
    if needs_binary_encoding(input) {
        double_quotes(&encode_binary(input))
    } else {
        double_quotes(input)
    }
}

/// Reverse [`escape_for_literal`] on a value read back from the database.
///
/// The engine has already collapsed doubled apostrophes. Values starting
/// with the sentinel are decoded; everything else is returned as-is.
pub fn unescape_from_literal(input: &[u8]) -> Result<Cow<'_, [u8]>, CodecError> {
    if input.first() == Some(&SENTINEL) {
        decode_binary(input).map(Cow::Owned)
    } else {
        Ok(Cow::Borrowed(input))
    }
}

/// Build a complete `'...'` literal for `input`.
pub fn quote_literal(input: &[u8]) -> Vec<u8> {
    let escaped = escape_for_literal(input);
    let mut out = Vec::with_capacity(escaped.len() + 2);
    out.push(QUOTE);
    out.extend_from_slice(&escaped);
    out.push(QUOTE);
    out
}

/// Escape a text value for a literal. Empty input stays empty.
#[inline]
pub fn escape_text(input: &str) -> String {
    if input.is_empty() {
        String::new()
    } else {
        input.replace('\'', "''")
    }
}
