//! Tracing setup shared by fanout binaries
//!
//! Output goes to the console, to daily rotated files under `log_dir`, or to
//! both, as human-readable text or JSON lines. Settings come from a
//! [`LogConfigBuilder`] and can be overridden by `LOG_*` environment
//! variables (see [`LogConfig::merge_env`]).
//!
//! Prefer structured fields over formatted messages:
//!
//! ```rust,ignore
//! warn!(artifact = %artifact.location, failed_sinks = ?names, "Archived with partial delivery");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fanout_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("Worker starting");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Match `raw` case-insensitively against a table of accepted spellings
fn parse_choice<T: Copy>(what: &str, raw: &str, table: &[(&str, T)]) -> Result<T> {
    let wanted = raw.trim().to_ascii_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| anyhow!("Invalid {}: {}", what, raw))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice(
            "log level",
            s,
            &[
                ("trace", LogLevel::Trace),
                ("debug", LogLevel::Debug),
                ("info", LogLevel::Info),
                ("warn", LogLevel::Warn),
                ("warning", LogLevel::Warn),
                ("error", LogLevel::Error),
            ],
        )
    }
}

/// Where log lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice(
            "log output",
            s,
            &[
                ("console", LogOutput::Console),
                ("stdout", LogOutput::Console),
                ("file", LogOutput::File),
                ("both", LogOutput::Both),
                ("all", LogOutput::Both),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice(
            "log format",
            s,
            &[("text", LogFormat::Text), ("pretty", LogFormat::Text), ("json", LogFormat::Json)],
        )
    }
}

/// Optional metadata printed alongside each event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineFields {
    pub location: bool,
    pub thread_ids: bool,
    pub targets: bool,
}

impl Default for LineFields {
    fn default() -> Self {
        Self {
            location: false,
            thread_ids: false,
            targets: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    pub log_dir: PathBuf,
    /// Rotated files are named `<prefix>.<date>`
    pub log_file_prefix: String,
    /// Comma-separated `EnvFilter` directives, e.g. `sqlx=warn,reqwest=info`
    pub filter_directives: Option<String>,
    pub fields: LineFields,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            output: LogOutput::default(),
            format: LogFormat::default(),
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "fanout".to_string(),
            filter_directives: None,
            fields: LineFields::default(),
        }
    }
}

/// Read and parse an environment variable, `None` when unset
fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("{}={}: {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Defaults overridden by the environment
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Apply whichever of these variables are set:
    ///
    /// | Variable | Values |
    /// |----------|--------|
    /// | `LOG_LEVEL` | trace, debug, info, warn, error |
    /// | `LOG_OUTPUT` | console, file, both |
    /// | `LOG_FORMAT` | text, json |
    /// | `LOG_DIR` | directory for rotated files |
    /// | `LOG_FILE_PREFIX` | file name prefix |
    /// | `LOG_FILTER` | extra filter directives |
    /// | `LOG_INCLUDE_LOCATION` | true/false |
    /// | `LOG_INCLUDE_THREAD_IDS` | true/false |
    /// | `LOG_INCLUDE_TARGETS` | true/false |
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_value("LOG_LEVEL")? {
            self.level = level;
        }
        if let Some(output) = env_value("LOG_OUTPUT")? {
            self.output = output;
        }
        if let Some(format) = env_value("LOG_FORMAT")? {
            self.format = format;
        }
        if let Some(dir) = env_value::<PathBuf>("LOG_DIR")? {
            self.log_dir = dir;
        }
        if let Some(prefix) = env_value::<String>("LOG_FILE_PREFIX")? {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = env_value::<String>("LOG_FILTER")? {
            self.filter_directives = Some(filter);
        }

        let fields = &mut self.fields;
        for (name, slot) in [
            ("LOG_INCLUDE_LOCATION", &mut fields.location),
            ("LOG_INCLUDE_THREAD_IDS", &mut fields.thread_ids),
            ("LOG_INCLUDE_TARGETS", &mut fields.targets),
        ] {
            if let Some(flag) = env_value::<bool>(name)? {
                *slot = flag;
            }
        }

        Ok(self)
    }

    fn filter(&self) -> Result<EnvFilter> {
        let base = EnvFilter::builder()
            .with_default_directive(LevelFilter::from(self.level).into())
            .from_env_lossy();

        self.filter_directives
            .iter()
            .flat_map(|d| d.split(','))
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .try_fold(base, |filter, directive| {
                let parsed = directive
                    .parse()
                    .with_context(|| format!("Bad log filter directive '{}'", directive))?;
                Ok::<_, anyhow::Error>(filter.add_directive(parsed))
            })
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(self.fields.targets)
            .with_thread_ids(self.fields.thread_ids)
            .with_file(self.fields.location)
            .with_line_number(self.fields.location)
            .with_span_events(FmtSpan::CLOSE);

        match self.format {
            LogFormat::Text => layer.boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    pub fn fields(mut self, fields: LineFields) -> Self {
        self.config.fields = fields;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Flushes the file writer on drop
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Call once and keep the guard until exit.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = config.filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    let mut guard = None;

    if config.output.console() {
        layers.push(config.layer(std::io::stdout, true));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log directory {}", config.log_dir.display()))?;
        let rolling = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, worker) = tracing_appender::non_blocking(rolling);
        layers.push(config.layer(writer, false));
        guard = Some(worker);
    }

    tracing_subscriber::registry()
        .with(layers.with_filter(filter))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard { _file: guard })
}
