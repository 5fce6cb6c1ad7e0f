//! CLI config for logging, and the subscriber it installs.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("cannot install the global subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How log lines look.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, one line per event.
    #[default]
    Full,
    /// Shorter lines, with span fields folded in.
    Compact,
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target, such as `debug` or
    /// `info,cachestore_node=trace`.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// -v   'debug'
    ///
    /// -vv  'trace'
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub log_verbose_count: u8,

    /// Logs: message format
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value_t = LogFormat::default(),
        value_enum,
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    /// The filter directive in effect, falling back to `default_filter`.
    pub fn filter(&self, default_filter: &str) -> String {
        match self.log_verbose_count {
            0 => self
                .log_filter
                .clone()
                .unwrap_or_else(|| default_filter.to_string()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }

    /// Installs a global `fmt` subscriber writing to stdout.
    pub fn install_global_subscriber(&self, default_filter: &str) -> Result<()> {
        let filter = self.filter(default_filter);
        let env_filter = EnvFilter::try_new(&filter)
            .map_err(|source| Error::InvalidFilter { filter, source })?;
        let registry = tracing_subscriber::registry().with(env_filter);
        match self.log_format {
            LogFormat::Full => registry.with(fmt::layer()).try_init()?,
            LogFormat::Compact => registry.with(fmt::layer().compact()).try_init()?,
        }
        Ok(())
    }
}
