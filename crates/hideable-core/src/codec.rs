//! Binary-safe encoding for SQL string literals.
//!
//! SQLite's literal escaping only doubles apostrophes, and SQL text cannot
//! carry NUL bytes at all. To store arbitrary bytes inside a quoted literal,
//! values are shifted by an offset key chosen per value so that as few bytes
//! as possible land on NUL, the escape marker or the apostrophe. The bytes
//! that still do are written as two-byte escape pairs.
//!
//! Encoded layout:
//!
//! ```text
//! +----------+-----+--------------------------------------+
//! | 0x01     | e   | body: (b - e) mod 256, escaped       |
//! | sentinel | key | 0x00, 0x01, 0x27 -> 0x01, shifted+1  |
//! +----------+-----+--------------------------------------+
//! ```
//!
//! The sentinel lets readers tell encoded values from plain text, see
//! [`crate::literal`].

use std::fmt;

/// First byte of every encoded value.
pub const SENTINEL: u8 = 0x01;

/// Body byte announcing that the next byte holds `shifted + 1`.
pub const ESCAPE_MARKER: u8 = 0x01;

/// The SQL string literal delimiter.
pub const QUOTE: u8 = b'\'';

/// Error returned when decoding bytes that `encode_binary` cannot produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input is not a well-formed encoded value.
    MalformedEncoding {
        /// What was wrong with the input.
        reason: &'static str,
        /// Byte offset at which the problem was detected.
        offset: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::MalformedEncoding { reason, offset } => {
                write!(f, "malformed binary encoding at byte {}: {}", offset, reason)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Returns true if a shifted byte must be written as an escape pair.
#[inline]
const fn needs_escape(shifted: u8) -> bool {
    matches!(shifted, 0x00 | ESCAPE_MARKER | QUOTE)
}

/// Pick the offset key that minimizes the number of escaped bytes.
///
/// A byte `b` needs escaping under key `e` when `b - e` is NUL, the escape
/// marker or the quote, i.e. when `b` is `e`, `e + 1` or `e + 0x27`. Key 0 is
/// never a candidate and neither is the quote itself, since the key is
/// written unescaped right after the sentinel. Ties go to the smallest key.
fn choose_offset(input: &[u8]) -> u8 {
    let mut counts = [0usize; 256];
    for &b in input {
        counts[usize::from(b)] += 1;
    }

    let cost = |e: u8| {
        counts[usize::from(e)]
            + counts[usize::from(e.wrapping_add(ESCAPE_MARKER))]
            + counts[usize::from(e.wrapping_add(QUOTE))]
    };

    let mut best = 1u8;
    let mut best_cost = usize::MAX;
    for e in 1..=u8::MAX {
        if e == QUOTE {
            continue;
        }
        let c = cost(e);
        if c < best_cost {
            best = e;
            best_cost = c;
            if c == 0 {
                break;
            }
        }
    }
    best
}

/// Encode arbitrary bytes so they survive a round trip through a quoted SQL
/// literal.
///
/// Empty input encodes to empty output. Anything else starts with
/// [`SENTINEL`] followed by the offset key, and never contains NUL or an
/// apostrophe.
///
/// # Examples
///
/// ```
/// use hideable_core::codec::{decode_binary, encode_binary};
///
/// let raw = b"it's\0binary";
/// let encoded = encode_binary(raw);
/// assert!(!encoded.contains(&0) && !encoded.contains(&b'\''));
/// assert_eq!(decode_binary(&encoded).unwrap(), raw);
/// ```
pub fn encode_binary(input: &[u8]) -> Vec<u8> {
    if input.is_empty() {
        return Vec::new();
    }

    let e = choose_offset(input);
    let mut out = Vec::with_capacity(input.len() + input.len() / 8 + 2);
    out.push(SENTINEL);
    out.push(e);
    for &b in input {
        let shifted = b.wrapping_sub(e);
        if needs_escape(shifted) {
            out.push(ESCAPE_MARKER);
            out.push(shifted.wrapping_add(1));
        } else {
            out.push(shifted);
        }
    }
    out
}

/// Decode a value produced by [`encode_binary`].
///
/// Empty input decodes to empty output. Input that does not start with the
/// sentinel, lacks the offset key, or ends in the middle of an escape pair
/// is rejected with [`CodecError::MalformedEncoding`].
pub fn decode_binary(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let Some((&first, rest)) = input.split_first() else {
        return Ok(Vec::new());
    };
    if first != SENTINEL {
        return Err(CodecError::MalformedEncoding {
            reason: "missing sentinel byte",
            offset: 0,
        });
    }
    let Some((&e, body)) = rest.split_first() else {
        return Err(CodecError::MalformedEncoding {
            reason: "missing offset key",
            offset: 1,
        });
    };

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let shifted = if body[i] == ESCAPE_MARKER {
            let Some(&next) = body.get(i + 1) else {
                return Err(CodecError::MalformedEncoding {
                    reason: "escape marker at end of input",
                    offset: i + 2,
                });
            };
            i += 2;
            next.wrapping_sub(1)
        } else {
            i += 1;
            body[i - 1]
        };
        out.push(shifted.wrapping_add(e));
    }
    Ok(out)
}

/// Number of bytes `encode_binary` would escape for `input`.
pub fn escaped_len(input: &[u8]) -> usize {
    if input.is_empty() {
        return 0;
    }
    let e = choose_offset(input);
    input
        .iter()
        .filter(|&&b| needs_escape(b.wrapping_sub(e)))
        .count()
}
