//! File configuration for CLI defaults, and its merge with CLI flags.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use resumable_downloader::download::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_PARALLELISM, DEFAULT_PROGRESS_STEP,
};

use crate::cli::Args;

const CONFIG_DIR_NAME: &str = "resumable-downloader";

/// `key = value` file configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Default download directory.
    pub output_dir: Option<PathBuf>,
    /// Default number of concurrent transfers.
    pub parallelism: Option<u8>,
    /// Resume partial files by default.
    pub prefer_breakpoint: Option<bool>,
    /// Default header timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Default progress step in percentage points.
    pub progress_step: Option<u8>,
}

impl FileConfig {
    /// Validates config values against CLI constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(parallelism) = self.parallelism
            && !(1..=64).contains(&parallelism)
        {
            bail!("Invalid config value for `parallelism`: {parallelism}. Expected range: 1..=64");
        }
        if let Some(secs) = self.connect_timeout_secs
            && !(1..=3600).contains(&secs)
        {
            bail!("Invalid config value for `connect_timeout_secs`: {secs}. Expected range: 1..=3600");
        }
        if let Some(step) = self.progress_step
            && !(1..=100).contains(&step)
        {
            bail!("Invalid config value for `progress_step`: {step}. Expected range: 1..=100");
        }
        Ok(())
    }
}

/// Effective settings after merging CLI flags over file values over defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub parallelism: usize,
    pub prefer_breakpoint: bool,
    pub connect_timeout: Duration,
    pub progress_step: u8,
}

impl Settings {
    pub fn resolve(args: &Args, file: &FileConfig) -> Self {
        Self {
            output_dir: args
                .dir
                .clone()
                .or_else(|| file.output_dir.clone())
                .unwrap_or_else(|| PathBuf::from(".")),
            parallelism: args
                .parallelism
                .or(file.parallelism)
                .map_or(DEFAULT_PARALLELISM, usize::from),
            prefer_breakpoint: args.breakpoint || file.prefer_breakpoint.unwrap_or(false),
            connect_timeout: args
                .connect_timeout
                .or(file.connect_timeout_secs)
                .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_secs),
            progress_step: args
                .progress_step
                .or(file.progress_step)
                .unwrap_or(DEFAULT_PROGRESS_STEP),
        }
    }
}

/// Location of `config.toml`: under `$XDG_CONFIG_HOME`, else `$HOME/.config`.
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    let non_empty = |name: &str| env::var_os(name).filter(|value| !value.is_empty());
    let base = non_empty("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| non_empty("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join(CONFIG_DIR_NAME).join("config.toml"))
}

/// Loads the config file from the default path; missing files yield defaults.
pub fn load_default_file_config() -> Result<FileConfig> {
    let Some(path) = resolve_default_config_path().filter(|path| path.exists()) else {
        return Ok(FileConfig::default());
    };
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw).with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (number, line) in raw.lines().enumerate().map(|(index, line)| (index + 1, line)) {
        let line = without_comment(line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=').map(|(k, v)| (k.trim(), v.trim())) else {
            bail!("Invalid config syntax on line {number}: expected key = value");
        };
        let invalid = || format!("Invalid `{key}` value on line {number}");

        match key {
            "output_dir" => cfg.output_dir = Some(quoted(value).with_context(invalid)?.into()),
            "parallelism" => cfg.parallelism = Some(integer(value).with_context(invalid)?),
            "prefer_breakpoint" => {
                cfg.prefer_breakpoint = Some(value.parse::<bool>().with_context(invalid)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(integer(value).with_context(invalid)?);
            }
            "progress_step" => cfg.progress_step = Some(integer(value).with_context(invalid)?),
            unknown => bail!("Unknown configuration key: '{unknown}' on line {number}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Cuts a `#` comment that is not inside a quoted string.
fn without_comment(line: &str) -> &str {
    let mut quoted = false;
    let cut = line.char_indices().find(|&(_, ch)| {
        if ch == '"' {
            quoted = !quoted;
        }
        ch == '#' && !quoted
    });
    cut.map_or(line, |(index, _)| &line[..index])
}

fn quoted(value: &str) -> Result<String> {
    value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Expected double-quoted string"))
}

fn integer<T>(value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(value.parse::<T>()?)
}
