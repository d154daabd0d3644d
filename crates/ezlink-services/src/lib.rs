//! ezlink-services: the host side of a chunked upload to a board over a
//! lossy message link.
//!
//! [`link::Link`] serialises writes to a [`link::Transport`];
//! [`router::StatusRouter`] sorts what comes back into chunk acks and
//! advisory status; [`uploader::Uploader`] drives the upgrade flow on top
//! of both. [`device::SimulatedDevice`] plays the board for tests and the
//! CLI.

pub mod ack;
pub mod device;
pub mod error;
pub mod frame;
pub mod link;
pub mod router;
pub mod session;
pub mod status;
pub mod uploader;

pub use ack::{AckRecord, AckTracker, RetryPolicy};
pub use device::{FaultPlan, SimulatedDevice};
pub use error::TransferError;
pub use frame::{Checksum, Frame, FrameAssembler, Payload};
pub use link::{InboundPayload, Link, LinkError, LinkSink, Transport};
pub use router::{Routed, StatusRouter};
pub use session::{SessionStats, TransferState};
pub use status::{Severity, StagingAnalysis, StagingState, StatusReporter, TracingReporter};
pub use uploader::{UploadReport, Uploader};
