//! Text escaping for dumped closure code.
//!
//! Printable ASCII passes through unchanged, a backslash becomes `\\`, and
//! every other byte becomes `\uXXXX` (four hex digits, always `00XX`).

use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscapeError {
    #[error("truncated escape sequence at offset {0}")]
    Truncated(usize),
    #[error("invalid escape sequence at offset {0}")]
    Invalid(usize),
    #[error("escaped byte out of range at offset {0}")]
    OutOfRange(usize),
    #[error("non-ascii character at offset {0}")]
    NonAscii(usize),
    #[error("body decodes to {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Escape raw code bytes into a printable string.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                // Writing to a String cannot fail.
                let _ = write!(out, "\\u{:04x}", b);
            }
        }
    }
    out
}

/// Reverse [`escape_bytes`].
pub fn unescape(body: &str) -> Result<Vec<u8>, EscapeError> {
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if !b.is_ascii() {
            return Err(EscapeError::NonAscii(i));
        }
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            Some(b'u') => {
                let hex = bytes.get(i + 2..i + 6).ok_or(EscapeError::Truncated(i))?;
                let hex = std::str::from_utf8(hex).map_err(|_| EscapeError::Invalid(i))?;
                let code = u16::from_str_radix(hex, 16).map_err(|_| EscapeError::Invalid(i))?;
                let byte = u8::try_from(code).map_err(|_| EscapeError::OutOfRange(i))?;
                out.push(byte);
                i += 6;
            }
            Some(_) => return Err(EscapeError::Invalid(i)),
            None => return Err(EscapeError::Truncated(i)),
        }
    }
    Ok(out)
}

/// Unescape a function body and check it against its recorded length.
pub fn unescape_body(body: &str, len: usize) -> Result<Vec<u8>, EscapeError> {
    let bytes = unescape(body)?;
    if bytes.len() != len {
        return Err(EscapeError::LengthMismatch {
            expected: len,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}
