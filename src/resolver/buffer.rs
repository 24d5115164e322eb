//! Positional reader over a raw DNS message

use std::{error::Error as StdError, fmt};

/// Errors produced while decoding a DNS message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// The message ended before the requested bytes
    Truncated,
    /// A domain name could not be decoded (bad label, forward or
    /// self-referencing compression pointer)
    MalformedName,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => f.write_str("truncated DNS message"),
            DecodeError::MalformedName => f.write_str("malformed domain name"),
        }
    }
}

impl StdError for DecodeError {}

/// A cursor over a complete DNS message.
///
/// The whole message is kept around because compressed domain names contain
/// absolute offsets into it. Reads only move the cursor forward; following a
/// compression pointer is a read subroutine that restores the cursor to just
/// past the pointer once the name completes.
pub(crate) struct WireBuffer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireBuffer<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> WireBuffer<'a> {
        WireBuffer { bytes, pos: 0 }
    }

    /// Current cursor position, in bytes from the start of the message
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    /// Reads a big-endian unsigned 16 bit integer
    pub(crate) fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from(hi) << 8 | u16::from(lo))
    }

    /// Advances the cursor by `n` bytes without interpreting them
    pub(crate) fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.bytes.len() - self.pos < n {
            return Err(DecodeError::Truncated);
        }
        self.pos += n;
        Ok(())
    }

    /// Decodes a domain name starting at the cursor.
    ///
    /// Labels are length-prefixed and terminated by a zero length label or a
    /// two byte compression pointer (top two bits set, remaining 14 bits an
    /// absolute offset). A pointer may only reference an earlier offset than
    /// its own, so chained pointers strictly decrease and cannot loop.
    pub(crate) fn read_name(&mut self) -> Result<String, DecodeError> {
        let mut labels: Vec<String> = Vec::new();
        // where to land the cursor once the first pointer has been followed
        let mut resume_at: Option<usize> = None;
        loop {
            let len = self.read_u8()? as usize;
            if len == 0 {
                break;
            }
            match len & 0xc0 {
                0xc0 => {
                    let low = self.read_u8()? as usize;
                    let target = (len & 0x3f) << 8 | low;
                    if target >= self.pos - 2 {
                        return Err(DecodeError::MalformedName);
                    }
                    if resume_at.is_none() {
                        resume_at = Some(self.pos);
                    }
                    self.pos = target;
                }
                0x00 => {
                    if self.bytes.len() - self.pos < len {
                        return Err(DecodeError::Truncated);
                    }
                    let raw = &self.bytes[self.pos..self.pos + len];
                    let label =
                        std::str::from_utf8(raw).map_err(|_| DecodeError::MalformedName)?;
                    labels.push(label.to_owned());
                    self.pos += len;
                }
                // 0x40 and 0x80 prefixes are reserved
                _ => return Err(DecodeError::MalformedName),
            }
        }
        if let Some(pos) = resume_at {
            self.pos = pos;
        }
        Ok(labels.join("."))
    }
}
