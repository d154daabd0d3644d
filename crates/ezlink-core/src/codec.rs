//! Binary-to-text codec for chunk payloads.
//!
//! Standard base64 with explicit `=` padding. Every [`BLOCK_FACTOR`] raw
//! bytes become four characters, so a chunk whose length is a multiple of
//! the block factor never carries padding mid-stream.

use base64::{engine::general_purpose, Engine};

/// Raw bytes consumed per encoded block.
pub const BLOCK_FACTOR: usize = 3;

/// Characters produced per encoded block.
const ENCODED_BLOCK: usize = 4;

pub fn encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode strictly. Length and alphabet are checked before the engine sees
/// the input so the error names what is wrong.
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    if text.len() % ENCODED_BLOCK != 0 {
        return Err(CodecError::Encoding(format!(
            "length {} is not a multiple of {ENCODED_BLOCK}",
            text.len()
        )));
    }
    if let Some(pos) = text.bytes().position(|b| !in_alphabet(b)) {
        return Err(CodecError::Encoding(format!(
            "invalid character at offset {pos}"
        )));
    }
    general_purpose::STANDARD
        .decode(text)
        .map_err(|e| CodecError::Encoding(e.to_string()))
}

fn in_alphabet(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')
}

/// Encoded length of `raw` bytes, padding included.
pub const fn encoded_len(raw: usize) -> usize {
    raw.div_ceil(BLOCK_FACTOR) * ENCODED_BLOCK
}

/// Largest block-aligned chunk whose wrapped message fits in `limit`.
pub fn max_chunk_size(prefix_len: usize, limit: usize) -> usize {
    limit.saturating_sub(prefix_len) / ENCODED_BLOCK * BLOCK_FACTOR
}

/// Check a chunk size against the link's message ceiling.
pub fn check_chunk_size(chunk_size: usize, prefix_len: usize, limit: usize) -> Result<(), CodecError> {
    if chunk_size == 0 || chunk_size % BLOCK_FACTOR != 0 {
        return Err(CodecError::UnalignedChunkSize { chunk_size });
    }
    let len = prefix_len + encoded_len(chunk_size);
    if len > limit {
        return Err(CodecError::MessageTooLarge { len, limit });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("message of {len} bytes exceeds the {limit}-byte link limit")]
    MessageTooLarge { len: usize, limit: usize },
    #[error("chunk size {chunk_size} is not a positive multiple of 3")]
    UnalignedChunkSize { chunk_size: usize },
}
