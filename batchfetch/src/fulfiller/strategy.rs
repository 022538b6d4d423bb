//! Transfer strategies: single-shot vs. chunked.
//!
//! The strategy is picked once, from the probe result, and never changes
//! for the lifetime of a fulfiller.

use crate::transport::{ByteRange, HeadResponse};

/// What the HEAD probe learned about a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probing is disabled for this target.
    Skipped,
    /// HEAD failed or did not carry what a chunked transfer needs.
    Unsupported,
    /// The server reported a size and accepts byte ranges.
    RangeCapable { content_length: u64 },
}

impl ProbeOutcome {
    /// Interpret a HEAD response.
    pub fn from_head(response: &HeadResponse) -> Self {
        match response.content_length() {
            Some(content_length) if response.accepts_byte_ranges() => {
                Self::RangeCapable { content_length }
            }
            _ => Self::Unsupported,
        }
    }
}

/// How a target's bytes are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// One GET for the whole body.
    SingleShot,
    /// Sequential ranged GETs appended to the destination.
    Chunked { expected_size: u64, chunk_size: u64 },
}

impl TransferStrategy {
    /// Pick the strategy for a probe outcome.
    ///
    /// Only resources strictly larger than one chunk are chunked.
    pub fn select(outcome: &ProbeOutcome, chunk_size: u64) -> Self {
        match *outcome {
            ProbeOutcome::RangeCapable { content_length } if content_length > chunk_size => {
                Self::Chunked {
                    expected_size: content_length,
                    chunk_size,
                }
            }
            _ => Self::SingleShot,
        }
    }

    /// True for [`TransferStrategy::Chunked`].
    pub fn is_chunked(&self) -> bool {
        matches!(self, Self::Chunked { .. })
    }
}

/// Next range to request given how many bytes are already on disk.
///
/// Returns `None` once `current_size` has reached `expected_size`.
pub fn next_range(expected_size: u64, chunk_size: u64, current_size: u64) -> Option<ByteRange> {
    let remaining = expected_size.checked_sub(current_size)?;
    if remaining == 0 {
        return None;
    }
    Some(ByteRange::from_len(current_size, chunk_size.min(remaining)))
}
