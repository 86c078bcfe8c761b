//! Incremental UTF-8 Decoding
//!
//! The generation engine writes raw bytes to its output channel and gives no
//! guarantee that a read boundary falls on a character boundary. The
//! [`ByteDecoder`] accepts one byte at a time and only yields a `char` once a
//! complete sequence has been seen.
//!
//! # Recovery
//!
//! Decoding never fails loudly. Bytes that can never form a valid character
//! are dropped (and counted), so a corrupt fragment cannot hold back the
//! characters that follow it.

use tracing::debug;

/// Longest byte sequence a single UTF-8 character can occupy
pub const MAX_PENDING_BYTES: usize = 4;

/// Byte-at-a-time UTF-8 decoder
#[derive(Clone, Debug, Default)]
pub struct ByteDecoder {
    /// Bytes of the character currently being assembled
    pending: Vec<u8>,
    /// Total bytes dropped as malformed
    discarded: u64,
}

impl ByteDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(MAX_PENDING_BYTES + 1),
            discarded: 0,
        }
    }

    /// Feed one byte, returning a character once one is complete
    pub fn feed(&mut self, byte: u8) -> Option<char> {
        self.pending.push(byte);

        match std::str::from_utf8(&self.pending) {
            Ok(decoded) => {
                let character = decoded.chars().next();
                self.pending.clear();
                character
            }
            // Incomplete: wait for more bytes unless the bound is exceeded
            Err(e) if e.error_len().is_none() => {
                if self.pending.len() > MAX_PENDING_BYTES {
                    self.discard("pending sequence exceeds maximum length");
                }
                None
            }
            Err(_) => {
                if self.pending.len() == 1 {
                    self.discard("byte cannot start a character");
                    return None;
                }
                // The newest byte broke an otherwise valid prefix. Drop the
                // prefix and give the byte a fresh start.
                self.pending.pop();
                self.discard("invalid continuation");
                self.feed(byte)
            }
        }
    }

    /// Whether a partial character is buffered
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of bytes dropped as malformed since creation
    #[must_use]
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Drop any partial character
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    fn discard(&mut self, reason: &'static str) {
        debug!(
            bytes = ?self.pending,
            reason,
            "Discarding malformed byte sequence"
        );
        self.discarded += self.pending.len() as u64;
        self.pending.clear();
    }
}
