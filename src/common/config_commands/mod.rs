//! CLI handlers for config subcommands.

mod inspect;
mod io;
mod reset;

pub use inspect::{inspect, ConfigReport};
pub(crate) use io::atomic_write;

use crate::common::config::config_path;
use anyhow::Result;

/// Print resolved config file path.
pub fn run_config_path() -> Result<()> {
    println!("{}", config_path().display());
    Ok(())
}

/// Print the stored config (or the merged view with `effective`) and flag
/// files the share subsystem would ignore.
pub fn run_config_show(effective: bool) -> Result<()> {
    let overrides = inspect::env_overrides(std::env::vars());
    inspect::show_config_with_io(
        &config_path(),
        effective,
        &overrides,
        &mut std::io::stdout().lock(),
        &mut std::io::stderr().lock(),
    )
}

/// Back up and reset config to defaults (with confirmation).
pub fn run_config_reset(yes: bool) -> Result<bool> {
    reset::reset_config(&config_path(), yes)
}
