//! `ezlink upload`: stream files to the board, then commit or stage.

use anyhow::{Context, Result};
use ezlink_core::EzlinkConfig;
use ezlink_services::{FaultPlan, UploadReport};
use serde::Serialize;

use super::{banner, connect, print_payloads, read_payloads, watch_progress};

/// What the simulated link should do wrong.
#[derive(Debug, Default)]
pub struct Faults {
    pub loss: f64,
    pub drops: Vec<u32>,
}

impl Faults {
    fn plan(&self) -> FaultPlan {
        self.drops
            .iter()
            .fold(FaultPlan::new().loss_rate(self.loss), |plan, &idx| plan.drop_frame(idx, 1))
    }
}

#[derive(Serialize)]
struct Summary<'a> {
    report: &'a UploadReport,
    staged: Vec<String>,
    installed: Vec<String>,
    restarts: u32,
}

pub async fn cmd_upload(
    config: &EzlinkConfig,
    paths: &[&str],
    root: Option<&str>,
    stage_only: bool,
    faults: &Faults,
    json: bool,
) -> Result<()> {
    let payloads = read_payloads(paths, root)?;
    let (device, uploader) = connect(config, faults.plan())?;

    if !json {
        banner(if stage_only { "Staging Upload" } else { "Upload" });
        print_payloads(&payloads);
        println!();
    }
    for p in payloads {
        uploader.add_file(p);
    }

    let progress = (!json).then(|| watch_progress(&uploader));
    let result = if stage_only {
        uploader.stage_only().await
    } else {
        uploader.start_upload().await
    };
    if let Some(handle) = progress {
        handle.abort();
    }
    let report = result.context("upload failed")?;

    let summary = Summary {
        report: &report,
        staged: device.staged().into_keys().collect(),
        installed: device.installed().into_keys().collect(),
        restarts: device.restarts(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    banner("Result");
    println!("  Files            : {}", report.stats.files_completed);
    println!("  Frames sent      : {}", report.stats.frames_sent);
    println!("  Frames acked     : {}", report.stats.frames_acked);
    println!("  Bytes sent       : {}", report.stats.bytes_sent);
    println!("  Retransmissions  : {}", report.stats.retransmissions);
    println!("  Committed        : {}", report.committed);
    println!("  Staged on board  : {}", summary.staged.join(", "));
    println!("  Installed        : {}", summary.installed.join(", "));
    println!("  Board restarts   : {}", summary.restarts);

    Ok(())
}
