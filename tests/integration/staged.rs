use std::sync::Arc;
use std::time::Duration;

use ezlink_services::{Payload, Severity, StagingState, TransferError, TransferState};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Staged upgrade
// ══════════════════════════════════════════════════════════════════════════════

/// Stage first, commit separately: nothing is installed until the commit.
#[tokio::test(start_paused = true)]
async fn stage_then_commit() {
    let device = board();
    device.install("main.py", b"v1".to_vec());
    let (uploader, _) = uploader_on(device.clone());
    uploader.add_file(Payload::new("main.py", b"v2".to_vec()));

    let report = uploader.stage_only().await.unwrap();
    assert!(!report.committed);
    assert_eq!(uploader.current_state(), TransferState::StagedToTemp);
    assert_eq!(device.installed().get("main.py").map(Vec::as_slice), Some(&b"v1"[..]));
    assert_eq!(device.staged().get("main.py").map(Vec::as_slice), Some(&b"v2"[..]));

    uploader.commit().await.unwrap();
    assert_eq!(uploader.current_state(), TransferState::Committed);
    assert_eq!(device.installed().get("main.py").map(Vec::as_slice), Some(&b"v2"[..]));
    assert_eq!(device.backup().get("main.py").map(Vec::as_slice), Some(&b"v1"[..]));
    assert!(device.staged().is_empty());
}

/// The four-step flow, with the board's analysis read between steps.
#[tokio::test(start_paused = true)]
async fn staged_steps_walk_the_board_to_clean() {
    let device = board();
    device.install("main.py", b"old main".to_vec());
    device.install("lib/util.mpy", b"old util".to_vec());
    let (uploader, recorder) = uploader_on(device.clone());
    uploader.add_file(Payload::new("main.py", pattern(500)));
    uploader.add_file(Payload::new("util.mpy", pattern(50)));

    uploader.stage_only().await.unwrap();
    uploader.check_status().await.unwrap();
    assert_eq!(
        uploader.last_analysis().map(|a| a.state),
        Some(StagingState::Step2Ready)
    );

    uploader.backup().await.unwrap();
    assert_eq!(uploader.current_state(), TransferState::BackupRequested);
    assert_eq!(device.backup().len(), 2);
    uploader.check_status().await.unwrap();
    assert_eq!(
        uploader.last_analysis().map(|a| a.state),
        Some(StagingState::Step3Ready)
    );

    uploader.apply().await.unwrap();
    assert_eq!(uploader.current_state(), TransferState::Applied);
    assert_eq!(device.installed().get("main.py"), Some(&pattern(500)));
    assert_eq!(device.installed().get("lib/util.mpy"), Some(&pattern(50)));

    uploader.cleanup().await.unwrap();
    assert_eq!(uploader.current_state(), TransferState::CleanedUp);
    uploader.check_status().await.unwrap();
    assert_eq!(
        uploader.last_analysis().map(|a| a.state),
        Some(StagingState::RollbackReady)
    );

    assert!(recorder.saw("STATUS_CHECK_COMPLETE", Severity::Success));
    assert!(recorder.saw("STEP2_BACKUP_SUCCESS", Severity::Success));
    assert!(recorder.saw("APPLY_PROGRESS", Severity::Progress));
    assert!(recorder.saw("STEP3_APPLY_SUCCESS", Severity::Success));
    assert!(recorder.saw("STEP4_CLEANUP_SUCCESS", Severity::Success));
    assert!(recorder.saw("RESTART_PROGRESS", Severity::Progress));
}

/// Rollback puts back what the last commit replaced.
#[tokio::test(start_paused = true)]
async fn rollback_after_commit_restores_previous_files() {
    let device = board();
    device.install("main.py", b"stable".to_vec());
    let (uploader, _) = uploader_on(device.clone());
    uploader.add_file(Payload::new("main.py", b"broken".to_vec()));

    uploader.start_upload().await.unwrap();
    assert_eq!(device.installed().get("main.py").map(Vec::as_slice), Some(&b"broken"[..]));

    uploader.rollback().await.unwrap();
    assert_eq!(uploader.current_state(), TransferState::RolledBack);
    assert_eq!(device.installed().get("main.py").map(Vec::as_slice), Some(&b"stable"[..]));
}

/// Staged steps on an empty staging area warn instead of failing.
#[tokio::test(start_paused = true)]
async fn steps_on_empty_staging_warn() {
    let device = board();
    let (uploader, recorder) = uploader_on(device.clone());

    uploader.backup().await.unwrap();
    uploader.apply().await.unwrap();
    assert!(recorder.saw("STEP2_WARNING", Severity::Warning));
    assert!(recorder.saw("STEP3_WARNING", Severity::Warning));
    assert!(device.installed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn control_commands_need_a_link() {
    let device = board();
    let (uploader, _) = uploader_on(device.clone());
    device.set_connected(false);

    assert_eq!(uploader.backup().await, Err(TransferError::NotConnected));
    assert_eq!(uploader.apply().await, Err(TransferError::NotConnected));
    assert_eq!(uploader.cleanup().await, Err(TransferError::NotConnected));
    assert_eq!(uploader.rollback().await, Err(TransferError::NotConnected));
    assert!(device.received().is_empty());
}

/// Cancel only stops uploads. A commit or rollback already under way runs
/// to completion and the board never sees an abort.
#[tokio::test(start_paused = true)]
async fn cancel_leaves_control_commands_alone() {
    let device = board();
    device.install("main.py", b"v1".to_vec());
    let (uploader, _) = uploader_on(device.clone());
    let uploader = Arc::new(uploader);
    uploader.add_file(Payload::new("main.py", b"v2".to_vec()));
    uploader.stage_only().await.unwrap();

    let committing = tokio::spawn({
        let uploader = uploader.clone();
        async move { uploader.commit().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(uploader.is_uploading());
    uploader.cancel().await;
    committing.await.unwrap().unwrap();
    assert_eq!(uploader.current_state(), TransferState::Committed);

    let rolling = tokio::spawn({
        let uploader = uploader.clone();
        async move { uploader.rollback().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    uploader.cancel().await;
    rolling.await.unwrap().unwrap();
    assert_eq!(uploader.current_state(), TransferState::RolledBack);

    assert!(!device.received().iter().any(|m| m == "UPGRADE:ABORT"));
    assert_eq!(device.installed().get("main.py").map(Vec::as_slice), Some(&b"v1"[..]));
}
