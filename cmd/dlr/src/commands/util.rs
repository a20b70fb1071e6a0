//! Utility functions for CLI commands.

use std::path::Path;

use anyhow::Context;
use dlr_bridge::RuntimeConfig;

use crate::Cli;

/// Gets the runtime configuration: the `--config` file when given,
/// otherwise the defaults with `DLR_LIBRARY_PATH` applied.
pub fn get_config(cli: &Cli) -> anyhow::Result<RuntimeConfig> {
    match cli.config.as_deref() {
        Some(path) => Ok(RuntimeConfig::load(path)?),
        None => Ok(RuntimeConfig::from_env()),
    }
}

/// Loads the `-f` request file. `.json` files are parsed as JSON,
/// everything else as YAML.
pub fn load_request<T: serde::de::DeserializeOwned>(cli: &Cli) -> anyhow::Result<T> {
    let path = cli
        .input
        .as_deref()
        .context("request file is required, use -f flag")?;
    let content = std::fs::read_to_string(path).with_context(|| format!("read request {path}"))?;

    let is_json = Path::new(path)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let request = if is_json {
        serde_json::from_str(&content).with_context(|| format!("parse request {path}"))?
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("parse request {path}"))?
    };
    Ok(request)
}

/// Writes `result` as YAML, or JSON with `--json`, to `-o` or stdout.
pub fn output_result<T: serde::Serialize>(cli: &Cli, result: &T) -> anyhow::Result<()> {
    let output = if cli.json {
        serde_json::to_string_pretty(result)?
    } else {
        serde_yaml::to_string(result)?
    };

    match cli.output.as_deref() {
        Some(path) => {
            std::fs::write(path, output).with_context(|| format!("write {path}"))?;
            eprintln!("\x1b[32m✓\x1b[0m wrote {path}");
        }
        None => print!("{output}"),
    }
    Ok(())
}

/// Prints verbose output if enabled.
pub fn print_verbose(cli: &Cli, msg: &str) {
    if cli.verbose {
        eprintln!("[verbose] {msg}");
    }
}

/// Prints warning message.
pub fn print_warning(msg: &str) {
    eprintln!("\x1b[33m⚠\x1b[0m {msg}");
}
