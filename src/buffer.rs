//! Growable receive buffer with pattern-delimited extraction

use crate::constants::MAX_BUFFER_SIZE;
use crate::error::{AmiError, AmiResult};

/// Byte buffer fed by socket reads and drained one delimited chunk at a time.
///
/// Consumed bytes are tracked with an offset; [`compact()`](Self::compact)
/// reclaims them once a chunk has been handed out.
#[derive(Debug, Default)]
pub(crate) struct PacketBuffer {
    data: Vec<u8>,
    start: usize,
}

impl PacketBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Reject a buffer that grew past [`MAX_BUFFER_SIZE`] — the peer is
    /// desynced or hostile.
    pub(crate) fn check_size_limits(&self) -> AmiResult<()> {
        let len = self.data.len() - self.start;
        if len > MAX_BUFFER_SIZE {
            return Err(AmiError::protocol(format!(
                "receive buffer exceeds {MAX_BUFFER_SIZE} bytes ({len} buffered)"
            )));
        }
        Ok(())
    }

    /// Extract the bytes before the first occurrence of `pattern`, consuming
    /// both. Returns `None` when the pattern is not buffered yet.
    pub(crate) fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let window = &self.data[self.start..];
        let idx = find_subsequence(window, pattern)?;
        let chunk = window[..idx].to_vec();
        self.start += idx + pattern.len();
        Some(chunk)
    }

    /// Reclaim consumed bytes.
    pub(crate) fn compact(&mut self) {
        if self.start > 0 {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }

    /// Unconsumed byte count.
    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.start
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
