use clap::{Parser, Subcommand, ValueEnum};
use infrastructure::config::{LogFormat, LogLevel};
use infrastructure::constants::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(
    name = "physnetd",
    about = "Physical network routing policy daemon",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "PHYSNETD_CONFIG")]
    pub config: String,

    /// Log level override (takes precedence over config file)
    #[arg(short, long)]
    pub log_level: Option<LogLevel>,

    /// Log format: json (default, production) or text (development)
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Log every kernel call instead of running `ip` and `ss`
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Output format for one-shot commands
    #[arg(short, long, default_value = "table", global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table (default)
    Table,
    /// JSON document
    Json,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Display version information
    Version,

    /// Parse and validate the configuration file, then exit
    Validate,

    /// Reconcile the kernel with the configuration once, then exit
    Apply,

    /// Reconcile, then keep the kernel in sync with the configuration
    /// file until SIGINT or SIGTERM
    Run,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_from(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults() {
        let cli = parse_from(&["physnetd"]);
        assert_eq!(cli.config, DEFAULT_CONFIG_PATH);
        assert!(cli.log_level.is_none());
        assert!(cli.log_format.is_none());
        assert!(!cli.dry_run);
        assert_eq!(cli.output, OutputFormat::Table);
        assert!(cli.command.is_none());
    }

    #[test]
    fn subcommands() {
        assert_eq!(parse_from(&["physnetd", "run"]).command, Some(Command::Run));
        assert_eq!(
            parse_from(&["physnetd", "apply"]).command,
            Some(Command::Apply)
        );
        assert_eq!(
            parse_from(&["physnetd", "validate"]).command,
            Some(Command::Validate)
        );
        assert_eq!(
            parse_from(&["physnetd", "version"]).command,
            Some(Command::Version)
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = parse_from(&["physnetd", "apply", "--dry-run", "-o", "json"]);
        assert!(cli.dry_run);
        assert_eq!(cli.output, OutputFormat::Json);
    }

    #[test]
    fn log_overrides() {
        let cli = parse_from(&[
            "physnetd",
            "--config",
            "/tmp/physnetd.yaml",
            "--log-level",
            "debug",
            "--log-format",
            "text",
        ]);
        assert_eq!(cli.config, "/tmp/physnetd.yaml");
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        assert_eq!(cli.log_format, Some(LogFormat::Text));
    }

    #[test]
    fn rejects_unknown_subcommand_and_level() {
        assert!(Cli::try_parse_from(["physnetd", "firewall"]).is_err());
        assert!(Cli::try_parse_from(["physnetd", "--log-level", "loud"]).is_err());
    }
}
