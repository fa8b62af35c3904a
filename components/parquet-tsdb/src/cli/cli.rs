// Local crates
use crate::commands::{convert::ConvertArgs, serve::ServeArgs};

// External crates
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

/// Default share of the detected memory limit used as soft ceiling.
pub const DEFAULT_MEMLIMIT_RATIO: f64 = 0.9;

/// Parsed command line. Produced once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(
    name = "parquet-tsdb",
    about = "A TSDB in parquet.",
    long_about = None,
    version,
    term_width = 100,
    after_help = "\
    EXAMPLES:
        parquet-tsdb convert --tsdb.path /var/lib/prometheus
        parquet-tsdb --logger.level DEBUG serve --http.address 0.0.0.0:9000"
)]
pub struct Cli {
    /// Share of the detected memory limit to use as soft ceiling, in (0, 1]
    #[arg(
        long = "memlimit.ratio",
        value_name = "RATIO",
        default_value_t = DEFAULT_MEMLIMIT_RATIO,
        value_parser = parse_memlimit_ratio,
        global = true
    )]
    pub memlimit_ratio: f64,

    /// Minimum level of emitted log records
    #[arg(
        long = "logger.level",
        value_name = "LEVEL",
        value_enum,
        default_value_t = LogLevel::Info,
        global = true
    )]
    pub log_level: LogLevel,

    /// Command to run
    #[command(subcommand)]
    pub command: Command,
}

/// The commands this binary can run. Exactly one is selected per invocation.
#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Convert TSDB blocks to parquet
    Convert(ConvertArgs),

    /// Serve queries and metrics
    Serve(ServeArgs),
}

impl Command {
    /// Name the command was selected by.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Convert(_) => "convert",
            Command::Serve(_) => "serve",
        }
    }
}

/// Accepted `--logger.level` values, spelled exactly as on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Everything.
    #[value(name = "DEBUG")]
    Debug,
    /// Informational and above.
    #[value(name = "INFO")]
    Info,
    /// Warnings and errors.
    #[value(name = "WARN")]
    Warn,
    /// Errors only.
    #[value(name = "ERROR")]
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Accepts finite ratios in `(0, 1]`.
pub fn parse_memlimit_ratio(raw: &str) -> Result<f64, String> {
    let ratio: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("`{raw}` is not a number"))?;

    if !ratio.is_finite() || ratio <= 0.0 || ratio > 1.0 {
        return Err(format!("`{raw}` must be greater than 0 and at most 1"));
    }
    Ok(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("parquet-tsdb").chain(args.iter().copied()))
    }

    #[test]
    fn schema_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_apply() {
        let cli = parse(&["serve"]).unwrap();
        assert_eq!(cli.memlimit_ratio, 0.9);
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(cli.command.name(), "serve");
    }

    #[test]
    fn global_flags_before_and_after_subcommand() {
        let before = parse(&["--logger.level", "DEBUG", "--memlimit.ratio=0.5", "serve"]).unwrap();
        let after = parse(&["serve", "--logger.level=DEBUG", "--memlimit.ratio", "0.5"]).unwrap();

        for cli in [before, after] {
            assert_eq!(cli.log_level, LogLevel::Debug);
            assert_eq!(cli.memlimit_ratio, 0.5);
        }
    }

    #[test]
    fn convert_is_selected_with_its_options() {
        let cli = parse(&["convert", "--tsdb.path", "/data"]).unwrap();
        match cli.command {
            Command::Convert(args) => assert_eq!(args.tsdb_path.to_str(), Some("/data")),
            other => panic!("Expected Convert command, got {other:?}"),
        }
    }

    #[test]
    fn unknown_subcommand_is_a_usage_error() {
        let err = parse(&["compact"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn missing_subcommand_is_a_usage_error() {
        let err = parse(&[]).unwrap_err();
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn log_level_outside_enumeration_is_rejected() {
        for bad in ["TRACE", "debug", "LOUD"] {
            let err = parse(&["--logger.level", bad, "serve"]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidValue, "{bad}");
        }
    }

    #[test]
    fn ratio_bounds() {
        assert_eq!(parse_memlimit_ratio("1"), Ok(1.0));
        assert_eq!(parse_memlimit_ratio("0.25"), Ok(0.25));
        for bad in ["0", "-0.5", "1.01", "NaN", "inf", "lots"] {
            assert!(parse_memlimit_ratio(bad).is_err(), "{bad}");
        }

        let err = parse(&["--memlimit.ratio", "1.5", "serve"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn level_filters() {
        assert_eq!(LevelFilter::from(LogLevel::Debug), LevelFilter::DEBUG);
        assert_eq!(LevelFilter::from(LogLevel::Error), LevelFilter::ERROR);
    }
}
