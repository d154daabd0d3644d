use std::sync::Arc;
use std::time::Duration;

use ezlink_core::EzlinkConfig;
use ezlink_services::{FaultPlan, Payload, SimulatedDevice, TransferError, TransferState};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Loss and retransmission
// ══════════════════════════════════════════════════════════════════════════════

/// One lost chunk costs exactly one retransmission and nothing else.
#[tokio::test(start_paused = true)]
async fn single_loss_is_retransmitted() {
    let device = SimulatedDevice::with_faults(FaultPlan::new().drop_frame(3, 1));
    let (uploader, _) = uploader_on(device.clone());
    let data = pattern(360 * 5);
    uploader.add_file(Payload::new("main.py", data.clone()));

    let report = uploader.start_upload().await.unwrap();
    assert_eq!(report.stats.retransmissions, 1);
    assert_eq!(report.stats.frames_sent, 5);
    assert_eq!(report.stats.frames_acked, 5);
    assert_eq!(data_frames(&device.received()), 6);
    assert_eq!(device.installed().get("main.py"), Some(&data));
}

/// A rejected chunk is resent until the board accepts it.
#[tokio::test(start_paused = true)]
async fn rejected_chunk_is_resent() {
    let device = SimulatedDevice::with_faults(FaultPlan::new().reject_frame(1, 3));
    let (uploader, _) = uploader_on(device.clone());
    uploader.add_file(Payload::new("main.py", pattern(100)));

    let report = uploader.start_upload().await.unwrap();
    assert_eq!(report.stats.retransmissions, 3);
    assert_eq!(device.installed().get("main.py").map(Vec::len), Some(100));
}

/// A seeded lossy link still delivers every byte.
#[tokio::test(start_paused = true)]
async fn lossy_link_delivers_intact_files() {
    let device = SimulatedDevice::with_faults(FaultPlan::new().loss_rate(0.2).seed(7));
    let (uploader, _) = uploader_on(device.clone());
    let a = pattern(3000);
    let b = pattern(777);
    uploader.add_file(Payload::new("a.py", a.clone()));
    uploader.add_file(Payload::new("b.mpy", b.clone()));

    let report = uploader.start_upload().await.unwrap();
    assert_eq!(report.stats.frames_acked, 9 + 3);
    assert_eq!(
        data_frames(&device.received()) as u64,
        report.stats.frames_sent + report.stats.retransmissions
    );
    assert_eq!(device.installed().get("a.py"), Some(&a));
    assert_eq!(device.installed().get("lib/b.mpy"), Some(&b));
}

/// Exhausting the retry budget fails the upload with the chunk index and
/// attempt count, and nothing is committed.
#[tokio::test(start_paused = true)]
async fn exhausted_retries_abort_without_commit() {
    let mut config = EzlinkConfig::default();
    config.upload.max_retries = 3;
    let device = SimulatedDevice::with_faults(FaultPlan::new().drop_frame(2, u32::MAX));
    let (uploader, _) = uploader_with(device.clone(), &config);
    uploader.add_file(Payload::new("main.py", pattern(1000)));

    let err = uploader.start_upload().await.unwrap_err();
    assert_eq!(
        err,
        TransferError::ChunkTransferFailed {
            chunk_index: 2,
            attempts: 3
        }
    );
    let received = device.received();
    // chunk 1 once, chunk 2 initial send plus three retries
    assert_eq!(data_frames(&received), 5);
    assert!(!received.iter().any(|m| m == "UPGRADE:COMMIT"));
    assert!(device.installed().is_empty());
    assert_eq!(uploader.current_state(), TransferState::Failed);
    assert!(!uploader.is_uploading());
}

/// Retry waits grow with each attempt: first ack wait, then backoff plus
/// the shorter retry wait.
#[tokio::test(start_paused = true)]
async fn retransmissions_back_off() {
    let device = SimulatedDevice::with_faults(FaultPlan::new().drop_frame(1, 3));
    let (uploader, _) = uploader_on(device.clone());
    uploader.add_file(Payload::new("main.py", pattern(10)));
    uploader.start_upload().await.unwrap();

    let sends: Vec<tokio::time::Instant> = device
        .received_at()
        .into_iter()
        .filter(|(m, _)| m.starts_with("UPGRADE:FILE_DATA:"))
        .map(|(_, at)| at)
        .collect();
    let gaps: Vec<Duration> = sends.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        [
            Duration::from_millis(5000 + 200),
            Duration::from_millis(2000 + 400),
            Duration::from_millis(2000 + 600),
        ]
    );
}

// ══════════════════════════════════════════════════════════════════════════════
//  Cancellation and link loss
// ══════════════════════════════════════════════════════════════════════════════

/// Cancel lets the in-flight chunk finish, sends ABORT once, and the board
/// discards what it staged.
#[tokio::test(start_paused = true)]
async fn cancel_is_idempotent_and_aborts_the_board() {
    let device = board();
    let (uploader, _) = uploader_on(device.clone());
    let uploader = Arc::new(uploader);
    uploader.add_file(Payload::new("first.py", pattern(100)));
    uploader.add_file(Payload::new("second.py", pattern(360 * 8)));

    let running = tokio::spawn({
        let uploader = uploader.clone();
        async move { uploader.start_upload().await }
    });
    while !device
        .received()
        .iter()
        .any(|m| m.starts_with("UPGRADE:FILE_START:second.py"))
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::join!(uploader.cancel(), uploader.cancel());
    assert_eq!(running.await.unwrap(), Err(TransferError::Cancelled));

    let received = device.received();
    assert_eq!(received.iter().filter(|m| *m == "UPGRADE:ABORT").count(), 1);
    assert!(!received.iter().any(|m| m == "UPGRADE:COMMIT"));
    assert!(device.staged().is_empty());
    assert!(device.installed().is_empty());
    assert_eq!(uploader.current_state(), TransferState::Aborted);
    assert!(!uploader.is_uploading());

    uploader.cancel().await;
    assert_eq!(
        device.received().iter().filter(|m| *m == "UPGRADE:ABORT").count(),
        1
    );
}

/// Losing the link mid-file surfaces as NotConnected, not as a retry storm.
#[tokio::test(start_paused = true)]
async fn link_loss_ends_the_upload() {
    let device = board();
    let (uploader, _) = uploader_on(device.clone());
    let uploader = Arc::new(uploader);
    uploader.add_file(Payload::new("main.py", pattern(360 * 6)));

    let running = tokio::spawn({
        let uploader = uploader.clone();
        async move { uploader.start_upload().await }
    });
    while data_frames(&device.received()) < 2 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    device.set_connected(false);

    assert_eq!(running.await.unwrap(), Err(TransferError::NotConnected));
    assert_eq!(uploader.retransmissions(), 0);
    assert_eq!(uploader.current_state(), TransferState::Failed);
    assert!(!uploader.is_uploading());
}
