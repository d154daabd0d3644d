//! `ezlink config`: show the resolved configuration.

use anyhow::{Context, Result};
use ezlink_core::EzlinkConfig;

pub fn cmd_config(config: &EzlinkConfig, write: bool) -> Result<()> {
    if write {
        let path = EzlinkConfig::write_default_if_missing().context("failed to write default config")?;
        println!("Config file: {}", path.display());
        return Ok(());
    }

    println!("# {}", EzlinkConfig::file_path().display());
    print!("{}", config.to_toml().context("failed to render config")?);
    Ok(())
}
