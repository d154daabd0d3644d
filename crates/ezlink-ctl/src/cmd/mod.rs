//! CLI command modules and the plumbing they share.

pub mod config;
pub mod staged;
pub mod upload;

use std::path::{Component, Path};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use ezlink_core::EzlinkConfig;
use ezlink_services::{FaultPlan, Link, Payload, Severity, SimulatedDevice, Uploader};
use tokio::task::JoinHandle;

/// Read each path into a payload named by its path relative to the upload
/// root: `root` when given, else the working directory.
pub fn read_payloads(paths: &[&str], root: Option<&str>) -> Result<Vec<Payload>> {
    paths
        .iter()
        .map(|path| -> Result<Payload> {
            let name = device_name(Path::new(path), root.map(Path::new))?;
            let data = std::fs::read(path).with_context(|| format!("failed to read file: {path}"))?;
            Ok(Payload::new(name, Bytes::from(data)))
        })
        .collect()
}

/// `fw/lib/util.py` under root `fw` becomes `lib/util.py` on the board.
fn device_name(path: &Path, root: Option<&Path>) -> Result<String> {
    let relative = match root {
        Some(root) => path
            .strip_prefix(root)
            .with_context(|| format!("{} is not under {}", path.display(), root.display()))?,
        None => path,
    };

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .with_context(|| format!("not a UTF-8 path: {}", path.display()))?,
            ),
            Component::CurDir => {}
            _ => bail!(
                "{} is outside the upload root; pass a relative path or --root",
                path.display()
            ),
        }
    }
    if parts.is_empty() {
        bail!("not a file name: {}", path.display());
    }
    Ok(parts.join("/"))
}

/// Simulated board plus an uploader wired to it, with device status
/// printed as it arrives.
pub fn connect(config: &EzlinkConfig, faults: FaultPlan) -> Result<(Arc<SimulatedDevice>, Uploader)> {
    let device = SimulatedDevice::with_faults(faults);
    let link = Link::new(device.clone(), config.link.command_settle());
    let reporter = |text: &str, severity: Severity| {
        println!("  [{severity:>8}] {text}");
    };
    let uploader = Uploader::new(link, config, Arc::new(reporter))
        .context("invalid upload configuration")?;
    Ok((device, uploader))
}

/// Print progress changes until aborted.
pub fn watch_progress(uploader: &Uploader) -> JoinHandle<()> {
    let mut rx = uploader.progress();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let pct = *rx.borrow_and_update();
            if pct > 0.0 {
                println!("  progress {pct:>5.1}%");
            }
        }
    })
}

pub fn print_payloads(payloads: &[Payload]) {
    for p in payloads {
        println!("  ┌─ {}", p.name);
        println!("  │  target   : {}", p.target_path());
        println!("  │  bytes    : {}", p.len());
        println!("  └─ checksum : {}", p.checksum());
    }
}

pub fn banner(title: &str) {
    println!("═══════════════════════════════════════");
    println!("  {title}");
    println!("═══════════════════════════════════════");
}
