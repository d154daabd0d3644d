//! ezlink integration test harness.
//!
//! Tests drive the full host stack (link queue, router, ack tracker and
//! uploader) against either the simulated board or a scripted transport
//! that answers chunks with canned replies. Every test runs on tokio's
//! paused clock, so settle delays and ack timeouts cost no wall time.
//!
//!   cargo test --test integration

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ezlink_core::wire::FILE_DATA_PREFIX;
use ezlink_core::EzlinkConfig;
use ezlink_services::{
    InboundPayload, Link, LinkError, LinkSink, Severity, SimulatedDevice, Transport, Uploader,
};

mod recovery;
mod routing;
mod staged;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Status lines the uploader forwarded, in arrival order.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<(String, Severity)>>>,
}

impl Recorder {
    pub fn lines(&self) -> Vec<(String, Severity)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn saw(&self, prefix: &str, severity: Severity) -> bool {
        self.lines()
            .iter()
            .any(|(text, s)| text.starts_with(prefix) && *s == severity)
    }
}

/// Uploader with default timings on top of `transport`.
pub fn uploader_on(transport: Arc<dyn Transport>) -> (Uploader, Recorder) {
    uploader_with(transport, &EzlinkConfig::default())
}

pub fn uploader_with(transport: Arc<dyn Transport>, config: &EzlinkConfig) -> (Uploader, Recorder) {
    let recorder = Recorder::default();
    let seen = recorder.seen.clone();
    let reporter = move |text: &str, severity: Severity| {
        seen.lock().unwrap().push((text.to_string(), severity));
    };
    let link = Link::new(transport, config.link.command_settle());
    let uploader = Uploader::new(link, config, Arc::new(reporter)).unwrap();
    (uploader, recorder)
}

pub fn board() -> Arc<SimulatedDevice> {
    SimulatedDevice::new()
}

/// Deterministic file content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

pub fn data_frames(messages: &[String]) -> usize {
    messages
        .iter()
        .filter(|m| m.starts_with(FILE_DATA_PREFIX))
        .count()
}

// ── Scripted transport ────────────────────────────────────────────────────────

/// Answers each `FILE_DATA` write with the next scripted batch of replies.
/// An exhausted script answers nothing. Other commands get no reply.
#[derive(Default)]
pub struct ScriptedTransport {
    sink: Mutex<Option<LinkSink>>,
    written: Mutex<Vec<String>>,
    script: Mutex<VecDeque<Vec<InboundPayload>>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Vec<InboundPayload>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    /// Push a message to the host outside of any reply.
    pub fn inject(&self, payload: impl Into<InboundPayload>) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.deliver(payload);
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn write(&self, message: &str) -> Result<(), LinkError> {
        self.written.lock().unwrap().push(message.to_string());
        if !message.starts_with(FILE_DATA_PREFIX) {
            return Ok(());
        }
        let replies = self.script.lock().unwrap().pop_front().unwrap_or_default();
        for reply in replies {
            self.inject(reply);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn attach(&self, sink: LinkSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }
}
