//! ezlink: drive a chunked firmware upload against a simulated board.

mod cmd;

use anyhow::{Context, Result};
use ezlink_core::EzlinkConfig;
use tracing_subscriber::EnvFilter;

use cmd::upload::Faults;

fn print_usage() {
    println!("Usage: ezlink [--json] <command>");
    println!();
    println!("Commands:");
    println!("  upload [--stage-only] [--loss <rate>] [--drop <chunk>[,..]] <files..>");
    println!("                  Upload files, then commit (or leave staged)");
    println!("  staged <files..>");
    println!("                  Stage, back up, apply and clean up in turn");
    println!("  config          Print the resolved configuration");
    println!("  config --write  Write the default config file if missing");
    println!();
    println!("Options:");
    println!("  --json          Print the upload summary as JSON");
    println!("  --root <dir>    Upload root; files keep their path below it");
    println!("                  (default: the working directory)");
    println!();
    println!("Logging follows RUST_LOG, else the config's logging.filter.");
}

fn parse_drops(list: &str) -> Result<Vec<u32>> {
    list.split(',')
        .map(|s| {
            s.trim()
                .parse()
                .with_context(|| format!("--drop expects chunk indices, got {s:?}"))
        })
        .collect()
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let config = EzlinkConfig::load().unwrap_or_else(|e| {
        eprintln!("warning: {e}; using defaults");
        EzlinkConfig::default()
    });

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::debug!(config = %EzlinkConfig::file_path().display(), "ezlink starting");

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut json = false;
    let mut stage_only = false;
    let mut write = false;
    let mut root: Option<&str> = None;
    let mut faults = Faults::default();
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--json" => json = true,
            "--stage-only" => stage_only = true,
            "--write" => write = true,
            "--loss" => {
                i += 1;
                faults.loss = args
                    .get(i)
                    .context("--loss requires a value")?
                    .parse()
                    .context("--loss must be a number between 0 and 1")?;
            }
            "--root" => {
                i += 1;
                root = Some(args.get(i).map(String::as_str).context("--root requires a directory")?);
            }
            "--drop" => {
                i += 1;
                faults.drops = parse_drops(args.get(i).context("--drop requires a value")?)?;
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["upload", files @ ..] if !files.is_empty() => {
            cmd::upload::cmd_upload(&config, files, root, stage_only, &faults, json).await
        }
        ["staged", files @ ..] if !files.is_empty() => cmd::staged::cmd_staged(&config, files, root).await,
        ["config"] => cmd::config::cmd_config(&config, write),
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
