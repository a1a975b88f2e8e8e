//! File configuration for CLI defaults, and merging it with the CLI flags.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bookqueue_core::{DEFAULT_CONCURRENCY, PostProcessHook, QueueConfig};

use crate::cli::Args;

/// `key = value` file configuration for bookqueue defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    /// Default worker pool size.
    pub concurrency: Option<u8>,
    /// Directory finished books are published into.
    pub ingest_dir: Option<PathBuf>,
    /// Directory for in-progress downloads.
    pub staging_dir: Option<PathBuf>,
    /// Post-processing program.
    pub hook: Option<PathBuf>,
    /// Post-processing timeout in seconds.
    pub hook_timeout_secs: Option<u64>,
    /// Name published files after the title.
    pub use_book_title: Option<bool>,
    /// Scheduler fallback poll interval.
    pub tick_interval_ms: Option<u64>,
    /// Grace period for in-flight jobs on shutdown.
    pub shutdown_grace_secs: Option<u64>,
    /// Minimum spacing between progress writes.
    pub progress_interval_ms: Option<u64>,
    /// Default log verbosity.
    pub verbosity: Option<VerbositySetting>,
    /// HTTP connect timeout in seconds.
    pub download_connect_timeout_secs: Option<u64>,
    /// HTTP read timeout in seconds.
    pub download_read_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.concurrency
            && !(1..=32).contains(&concurrency)
        {
            bail!("Invalid config value for `concurrency`: {concurrency}. Expected range: 1..=32");
        }
        if let Some(tick) = self.tick_interval_ms
            && !(10..=60_000).contains(&tick)
        {
            bail!("Invalid config value for `tick_interval_ms`: {tick}. Expected range: 10..=60000");
        }
        if let Some(grace) = self.shutdown_grace_secs
            && grace > 300
        {
            bail!("Invalid config value for `shutdown_grace_secs`: {grace}. Expected range: 0..=300");
        }
        validate_timeout_secs("hook_timeout_secs", self.hook_timeout_secs)?;
        validate_timeout_secs(
            "download_connect_timeout_secs",
            self.download_connect_timeout_secs,
        )?;
        validate_timeout_secs(
            "download_read_timeout_secs",
            self.download_read_timeout_secs,
        )?;
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Log filter used when neither `RUST_LOG` nor a CLI flag decides.
    #[must_use]
    pub fn log_level(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose | Self::Debug => "debug",
            Self::Quiet => "error",
        }
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/bookqueue/config.toml`
/// 2. `$HOME/.config/bookqueue/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("bookqueue")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("bookqueue")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file named on the command line, or the default one if it exists.
///
/// An explicit path must exist; a missing default file yields an empty config.
pub fn load_file_config(explicit: Option<&Path>) -> Result<FileConfig> {
    if let Some(path) = explicit {
        return read_file_config(path);
    }
    match resolve_default_config_path() {
        Some(path) if path.exists() => read_file_config(&path),
        _ => Ok(FileConfig::default()),
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "concurrency" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                let n = u8::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("Integer value out of range for u8"))
                    .with_context(context)?;
                cfg.concurrency = Some(n);
            }
            "ingest_dir" => {
                cfg.ingest_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "staging_dir" => {
                cfg.staging_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "hook" => {
                cfg.hook = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "hook_timeout_secs" => {
                cfg.hook_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "use_book_title" => {
                cfg.use_book_title = Some(parse_boolean(value).with_context(context)?);
            }
            "tick_interval_ms" => {
                cfg.tick_interval_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            "shutdown_grace_secs" => {
                cfg.shutdown_grace_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "progress_interval_ms" => {
                cfg.progress_interval_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            "verbosity" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.verbosity = Some(parse_verbosity(&parsed).with_context(|| {
                    format!("Invalid `verbosity` value '{parsed}' on line {line_no}")
                })?);
            }
            "download_connect_timeout_secs" => {
                cfg.download_connect_timeout_secs =
                    Some(parse_integer_u64(value).with_context(context)?);
            }
            "download_read_timeout_secs" => {
                cfg.download_read_timeout_secs =
                    Some(parse_integer_u64(value).with_context(context)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        _ => bail!("Expected one of: default, verbose, quiet, debug"),
    }
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

/// Settings for one run after CLI flags have been laid over the file config.
#[derive(Debug)]
pub struct ResolvedSettings {
    /// Coordinator and worker settings.
    pub queue: QueueConfig,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP read timeout.
    pub read_timeout: Duration,
}

/// Merges CLI flags over file values over built-in defaults.
#[must_use]
pub fn resolve_settings(args: &Args, file: &FileConfig) -> ResolvedSettings {
    let defaults = QueueConfig::default();

    let concurrency = args
        .concurrency
        .or(file.concurrency)
        .map_or(DEFAULT_CONCURRENCY, usize::from);
    let tick_interval = args
        .tick_ms
        .or(file.tick_interval_ms)
        .map_or(defaults.tick_interval, Duration::from_millis);

    let hook = args.hook.clone().or_else(|| file.hook.clone()).map(|program| {
        let hook = PostProcessHook::new(program);
        match file.hook_timeout_secs {
            Some(secs) => hook.with_timeout(Duration::from_secs(secs)),
            None => hook,
        }
    });

    let queue = QueueConfig {
        concurrency,
        tick_interval,
        shutdown_grace: file
            .shutdown_grace_secs
            .map_or(defaults.shutdown_grace, Duration::from_secs),
        progress_interval: file
            .progress_interval_ms
            .map_or(defaults.progress_interval, Duration::from_millis),
        staging_dir: args
            .staging_dir
            .clone()
            .or_else(|| file.staging_dir.clone())
            .unwrap_or(defaults.staging_dir),
        ingest_dir: args
            .ingest_dir
            .clone()
            .or_else(|| file.ingest_dir.clone())
            .unwrap_or(defaults.ingest_dir),
        use_book_title: args.use_title || file.use_book_title.unwrap_or(false),
        hook,
    };

    ResolvedSettings {
        queue,
        connect_timeout: Duration::from_secs(
            file.download_connect_timeout_secs
                .unwrap_or(bookqueue_core::CONNECT_TIMEOUT_SECS),
        ),
        read_timeout: Duration::from_secs(
            file.download_read_timeout_secs
                .unwrap_or(bookqueue_core::READ_TIMEOUT_SECS),
        ),
    }
}

/// Default log filter. `RUST_LOG` still wins over this at subscriber setup.
///
/// Priority: quiet flag > verbose flag > config verbosity > info.
#[must_use]
pub fn resolve_default_log_level(args: &Args, file: &FileConfig) -> &'static str {
    if args.quiet {
        return "error";
    }
    match args.verbose {
        0 => file.verbosity.map_or("info", VerbositySetting::log_level),
        1 => "debug",
        _ => "trace",
    }
}
