//! Frame assembly: payload → ordered, bounded, encoded `FILE_DATA` frames.

use std::fmt;

use bytes::Bytes;
use ezlink_core::codec::{self, CodecError};
use ezlink_core::wire::{self, Command, FILE_DATA_PREFIX};

/// A named file queued for upload. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub name: String,
    pub data: Bytes,
}

impl Payload {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Install path on the board.
    pub fn target_path(&self) -> String {
        wire::target_path(&self.name)
    }

    pub fn checksum(&self) -> Checksum {
        Checksum::of(&self.data)
    }
}

/// Additive checksum: byte sum mod 2^32. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checksum(pub u32);

impl Checksum {
    pub fn of(bytes: &[u8]) -> Self {
        Checksum(
            bytes
                .iter()
                .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b))),
        )
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

/// One encoded chunk, ready for the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 1-based; doubles as the ack correlation index.
    pub sequence: u32,
    pub raw: Bytes,
    /// Full wire message, prefix included.
    pub encoded: String,
}

impl Frame {
    pub fn checksum(&self) -> Checksum {
        Checksum::of(&self.raw)
    }
}

/// Splits payloads into frames of at most `chunk_size` raw bytes.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    chunk_size: usize,
    message_limit: usize,
}

impl FrameAssembler {
    /// Fails when a full chunk would not fit the link's message limit.
    pub fn new(chunk_size: usize, message_limit: usize) -> Result<Self, CodecError> {
        codec::check_chunk_size(chunk_size, FILE_DATA_PREFIX.len(), message_limit)?;
        Ok(Self {
            chunk_size,
            message_limit,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn frame_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Frames for `payload`, in send order.
    pub fn frames<'a>(
        &'a self,
        payload: &'a Payload,
    ) -> impl Iterator<Item = Result<Frame, CodecError>> + 'a {
        let len = payload.len();
        (0..self.frame_count(len)).map(move |i| {
            let start = i * self.chunk_size;
            let end = (start + self.chunk_size).min(len);
            self.assemble(i as u32 + 1, payload.data.slice(start..end))
        })
    }

    fn assemble(&self, sequence: u32, raw: Bytes) -> Result<Frame, CodecError> {
        let body = codec::encode(&raw);
        verify_round_trip(sequence, &raw, &body);

        let encoded = Command::FileData(body).to_string();
        if encoded.len() > self.message_limit {
            return Err(CodecError::MessageTooLarge {
                len: encoded.len(),
                limit: self.message_limit,
            });
        }
        Ok(Frame {
            sequence,
            raw,
            encoded,
        })
    }
}

/// Decode the chunk back and compare checksums. Logs, never fails.
fn verify_round_trip(sequence: u32, raw: &[u8], body: &str) {
    let expected = Checksum::of(raw);
    match codec::decode(body) {
        Ok(decoded) => {
            let actual = Checksum::of(&decoded);
            if actual != expected {
                tracing::warn!(sequence, %expected, %actual, "chunk checksum mismatch after decode");
            } else {
                tracing::trace!(sequence, checksum = %expected, len = raw.len(), "chunk encoded");
            }
        }
        Err(e) => tracing::warn!(sequence, error = %e, "chunk failed to decode back"),
    }
}
