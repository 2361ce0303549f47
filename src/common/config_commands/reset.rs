//! `config reset`: back up the stored file, then write defaults.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use super::io::atomic_write;
use crate::common::config::{ConfigStore, UploadConfig};

const UNPARSEABLE: &str = "(unparseable file)";

pub(super) fn reset_config(path: &Path, yes: bool) -> Result<bool> {
    let interactive = std::io::stdin().is_terminal();
    reset_config_with_io(
        path,
        yes,
        interactive,
        &mut std::io::stdin().lock(),
        &mut std::io::stdout().lock(),
    )
}

/// Where the replaced file is kept: `axon_upload.json` -> `axon_upload.json.bak`.
fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Dotted setting names whose stored value differs from the default.
///
/// Keys absent from the file already take their default and are skipped;
/// keys the schema does not know are reported since reset drops them.
fn changed_settings(stored: &Value, defaults: &Value) -> Vec<String> {
    let mut changed = Vec::new();
    collect_changes("", stored, defaults, &mut changed);
    changed
}

fn collect_changes(prefix: &str, stored: &Value, defaults: &Value, changed: &mut Vec<String>) {
    let (Value::Object(stored), Value::Object(defaults)) = (stored, defaults) else {
        if stored != defaults {
            let name = if prefix.is_empty() { UNPARSEABLE } else { prefix };
            changed.push(name.to_string());
        }
        return;
    };

    let keys: BTreeSet<&String> = stored.keys().collect();
    for key in keys {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match defaults.get(key) {
            Some(default) => collect_changes(&name, &stored[key], default, changed),
            None => changed.push(name),
        }
    }
}

fn reset_config_with_io(
    path: &Path,
    yes: bool,
    interactive: bool,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<bool> {
    let existing = match fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config file {}", path.display()))
        }
    };

    let defaults = UploadConfig::default();
    let changed = match existing.as_deref().map(|text| serde_json::from_str::<Value>(text)) {
        None => Vec::new(),
        Some(Ok(stored)) => changed_settings(
            &stored,
            &serde_json::to_value(&defaults).context("Failed to serialize default config")?,
        ),
        Some(Err(_)) => vec![UNPARSEABLE.to_string()],
    };

    if existing.is_some() && changed.is_empty() {
        writeln!(output, "Config at {} already matches defaults.", path.display())?;
        return Ok(false);
    }

    if !changed.is_empty() && !yes {
        if !interactive {
            bail!(
                "Reset would revert {}; pass --yes to confirm",
                changed.join(", ")
            );
        }
        writeln!(output, "Resetting {} reverts:", path.display())?;
        for name in &changed {
            writeln!(output, "  {name}")?;
        }
        write!(output, "Continue? [y/N]: ")?;
        output.flush()?;

        let mut answer = String::new();
        input.read_line(&mut answer)?;
        let answer = answer.trim();
        if !(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")) {
            writeln!(output, "Left {} unchanged.", path.display())?;
            return Ok(false);
        }
    }

    if let Some(text) = &existing {
        let backup = backup_path(path);
        atomic_write(&backup, text)?;
        writeln!(output, "Previous config saved to {}", backup.display())?;
    }
    ConfigStore::new(path).save(&defaults)?;
    writeln!(output, "Config reset to defaults: {}", path.display())?;
    Ok(true)
}
