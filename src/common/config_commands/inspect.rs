//! Diagnosing the stored upload config for `config show`.

use anyhow::{bail, Context, Result};
use serde_json::error::Category;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::common::config::{ConfigStore, UploadConfig, ENV_PREFIX};

/// What the config file holds, judged the way the share subsystem loads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigReport {
    /// No file; built-in defaults apply.
    Missing,
    Valid(UploadConfig),
    /// Not JSON at all.
    Malformed {
        line: usize,
        column: usize,
        message: String,
    },
    /// JSON, but a value has the wrong shape or fails validation.
    Rejected(String),
}

impl ConfigReport {
    /// Whether loading falls back to defaults because of this file.
    pub fn falls_back(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::Rejected(_))
    }
}

/// Classifies the file at `path`. Environment overrides are not applied.
pub fn inspect(path: &Path) -> Result<ConfigReport> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigReport::Missing),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config file {}", path.display()))
        }
    };

    let config: UploadConfig = match serde_json::from_str(&text) {
        Ok(config) => config,
        Err(e) if e.classify() == Category::Data => return Ok(ConfigReport::Rejected(e.to_string())),
        Err(e) => {
            return Ok(ConfigReport::Malformed {
                line: e.line(),
                column: e.column(),
                message: e.to_string(),
            })
        }
    };

    Ok(match config.validate() {
        Ok(()) => ConfigReport::Valid(config),
        Err(e) => ConfigReport::Rejected(format!("{e:#}")),
    })
}

/// `AXON_UPLOAD_*` variable names among `vars`, sorted.
pub(super) fn env_overrides(vars: impl IntoIterator<Item = (String, String)>) -> Vec<String> {
    let mut names: Vec<String> = vars
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| name.starts_with(ENV_PREFIX))
        .collect();
    names.sort();
    names
}

/// Prints the stored file, or the merged result with `effective`.
///
/// Fails when the file would make the share subsystem fall back to defaults.
pub(super) fn show_config_with_io(
    path: &Path,
    effective: bool,
    overrides: &[String],
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<()> {
    let report = inspect(path)?;

    match &report {
        ConfigReport::Missing => {
            writeln!(stderr, "No upload config at {}; defaults are in effect.", path.display())?;
        }
        ConfigReport::Valid(_) if !effective => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            write!(stdout, "{text}")?;
            if !text.ends_with('\n') {
                writeln!(stdout)?;
            }
        }
        ConfigReport::Valid(_) => {}
        ConfigReport::Malformed {
            line,
            column,
            message,
        } => {
            writeln!(
                stderr,
                "{}:{line}:{column}: invalid JSON: {message}",
                path.display()
            )?;
        }
        ConfigReport::Rejected(reason) => {
            writeln!(stderr, "{}: {reason}", path.display())?;
        }
    }

    if report.falls_back() {
        bail!(
            "Config at {} is not usable; sharing runs on defaults until it is fixed \
             or reset with `axon-upload config reset`",
            path.display()
        );
    }

    if effective {
        let merged = ConfigStore::new(path).try_load()?;
        let text =
            serde_json::to_string_pretty(&merged).context("Failed to serialize upload config")?;
        writeln!(stdout, "{text}")?;
        if !overrides.is_empty() {
            writeln!(stderr, "Environment overrides: {}", overrides.join(", "))?;
        }
    }

    Ok(())
}
