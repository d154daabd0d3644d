use ezlink_core::codec::CodecError;

use crate::link::LinkError;

/// Errors surfaced by the transfer state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("an upload is already in progress")]
    AlreadyUploading,
    #[error("no files queued for upload")]
    NoFiles,
    #[error("link is not connected")]
    NotConnected,
    #[error("chunk {chunk_index} failed after {attempts} retransmissions")]
    ChunkTransferFailed { chunk_index: u32, attempts: u32 },
    #[error("upload cancelled")]
    Cancelled,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Link(LinkError),
}

impl From<LinkError> for TransferError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::NotConnected => TransferError::NotConnected,
            other => TransferError::Link(other),
        }
    }
}
