use bytes::Bytes;
use ezlink_services::{FaultPlan, InboundPayload, Payload, Severity, SimulatedDevice};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Inbound routing
// ══════════════════════════════════════════════════════════════════════════════

fn raw(text: &str) -> InboundPayload {
    InboundPayload::from(Bytes::copy_from_slice(text.as_bytes()))
}

/// Acks arriving as raw bytes with a line terminator resolve their chunk.
#[tokio::test(start_paused = true)]
async fn byte_acks_with_line_endings_are_understood() {
    let transport = ScriptedTransport::new(vec![
        vec![raw("CHUNK_ACK:1:OK:OK:360\r\n")],
        vec![raw("CHUNK_ACK:2:OK:OK:40\n")],
    ]);
    let (uploader, _) = uploader_on(transport.clone());
    uploader.add_file(Payload::new("main.py", pattern(400)));

    let report = uploader.start_upload().await.unwrap();
    assert_eq!(report.stats.retransmissions, 0);
    assert_eq!(data_frames(&transport.written()), 2);
}

/// A malformed ack is dropped; the chunk times out and is resent.
#[tokio::test(start_paused = true)]
async fn malformed_ack_counts_as_no_ack() {
    let transport = ScriptedTransport::new(vec![
        vec!["CHUNK_ACK:1:MAYBE:??".into()],
        vec!["CHUNK_ACK:1:OK:OK:10".into()],
    ]);
    let (uploader, _) = uploader_on(transport.clone());
    uploader.add_file(Payload::new("main.py", pattern(10)));

    let report = uploader.start_upload().await.unwrap();
    assert_eq!(report.stats.retransmissions, 1);
    assert_eq!(data_frames(&transport.written()), 2);
}

/// An ack for another chunk does not resolve the pending one.
#[tokio::test(start_paused = true)]
async fn ack_for_wrong_chunk_is_not_taken() {
    let transport = ScriptedTransport::new(vec![
        vec!["CHUNK_ACK:9:OK:OK:10".into()],
        vec!["CHUNK_ACK:1:OK:OK:10".into()],
    ]);
    let (uploader, _) = uploader_on(transport.clone());
    uploader.add_file(Payload::new("main.py", pattern(10)));

    let report = uploader.start_upload().await.unwrap();
    assert_eq!(report.stats.retransmissions, 1);
}

/// Status lines interleaved with acks reach the reporter with their
/// severity and never disturb the transfer.
#[tokio::test(start_paused = true)]
async fn status_lines_reach_the_reporter() {
    let transport = ScriptedTransport::new(vec![vec![
        "STEP2_WARNING:low memory".into(),
        "CHUNK_ACK:1:OK:OK:10".into(),
        "BACKUP_FILE_START:1/1:main.py".into(),
        "FIRMWARE_VERSION:1.3".into(),
    ]]);
    let (uploader, recorder) = uploader_on(transport.clone());
    uploader.add_file(Payload::new("main.py", pattern(10)));

    uploader.start_upload().await.unwrap();
    assert!(recorder.saw("STEP2_WARNING", Severity::Warning));
    assert!(recorder.saw("BACKUP_FILE_START", Severity::Progress));
    assert!(!recorder.lines().iter().any(|(t, _)| t.starts_with("FIRMWARE_VERSION")));
    assert!(!recorder.lines().iter().any(|(t, _)| t.starts_with("CHUNK_ACK")));
}

/// Identical status lines inside the dedup window are reported once.
#[tokio::test(start_paused = true)]
async fn repeated_status_is_reported_once() {
    let transport = ScriptedTransport::new(Vec::new());
    let (_uploader, recorder) = uploader_on(transport.clone());

    transport.inject("STATUS_CHECK_START");
    transport.inject("STATUS_CHECK_START");
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    transport.inject("STATUS_CHECK_START");

    assert_eq!(recorder.lines().len(), 2);
}

/// A radio that repeats every ack neither stalls nor double-counts.
#[tokio::test(start_paused = true)]
async fn duplicated_acks_are_harmless() {
    let device = SimulatedDevice::with_faults(FaultPlan::new().duplicate_acks());
    let (uploader, _) = uploader_on(device.clone());
    let data = pattern(360 * 3);
    uploader.add_file(Payload::new("main.py", data.clone()));

    let report = uploader.start_upload().await.unwrap();
    assert_eq!(report.stats.frames_acked, 3);
    assert_eq!(report.stats.retransmissions, 0);
    assert_eq!(device.installed().get("main.py"), Some(&data));
}

/// Status analysis from the board is kept as the latest snapshot.
#[tokio::test(start_paused = true)]
async fn unsolicited_analysis_is_retained() {
    let transport = ScriptedTransport::new(Vec::new());
    let (uploader, recorder) = uploader_on(transport.clone());

    transport.inject("STATUS_ANALYSIS:ROLLBACK_READY:backup only");
    let analysis = uploader.last_analysis().unwrap();
    assert_eq!(analysis.state.as_str(), "ROLLBACK_READY");
    assert_eq!(analysis.detail, "backup only");
    assert!(recorder.saw("STATUS_ANALYSIS", Severity::Info));
}
