//! `ezlink staged`: stage, back up, apply, clean up.

use anyhow::{Context, Result};
use ezlink_core::EzlinkConfig;
use ezlink_services::FaultPlan;

use super::{banner, connect, print_payloads, read_payloads};

pub async fn cmd_staged(config: &EzlinkConfig, paths: &[&str], root: Option<&str>) -> Result<()> {
    let payloads = read_payloads(paths, root)?;
    let (device, uploader) = connect(config, FaultPlan::new())?;

    banner("Staged Upgrade");
    print_payloads(&payloads);
    for p in payloads {
        uploader.add_file(p);
    }

    println!("\n  Step 1: stage files");
    let report = uploader.stage_only().await.context("staging failed")?;
    println!("  staged {} files, {} retransmissions", report.stats.files_completed, report.stats.retransmissions);

    uploader.check_status().await.context("status check failed")?;
    if let Some(analysis) = uploader.last_analysis() {
        println!("  board: {} ({})", analysis.state.as_str(), analysis.state.recommendation());
    }

    println!("\n  Step 2: backup");
    uploader.backup().await.context("backup failed")?;
    println!("\n  Step 3: apply");
    uploader.apply().await.context("apply failed")?;
    println!("\n  Step 4: cleanup");
    uploader.cleanup().await.context("cleanup failed")?;

    println!();
    banner("Result");
    println!("  State          : {}", uploader.current_state());
    println!("  Installed      : {}", device.installed().into_keys().collect::<Vec<_>>().join(", "));
    println!("  Backed up      : {}", device.backup().into_keys().collect::<Vec<_>>().join(", "));
    println!("  Board restarts : {}", device.restarts());

    Ok(())
}
