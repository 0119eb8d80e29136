use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const CONFIG_ENV: &str = "RAMPART_CONFIG";
const DEFAULT_CONFIG: &str = "rampart.toml";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an experiment against its targets
    Run {
        /// Path to the experiment config, defaults to $RAMPART_CONFIG or ./rampart.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Disable the flamegraph collector on every target
        #[arg(long)]
        no_instrument: bool,

        /// Disable Prometheus queries
        #[arg(long)]
        no_prometheus: bool,
    },

    /// Print the load ramp without touching any target
    Plan {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

pub fn parse() -> Args {
    Args::parse()
}

/// The explicit path if given, otherwise `$RAMPART_CONFIG`, otherwise `./rampart.toml`.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_collector_switches() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "rampart",
            "-v",
            "run",
            "--config",
            "fixtures/experiment.toml",
            "--no-instrument",
        ])?;

        assert!(args.verbose);
        match args.command {
            Commands::Run {
                config,
                no_instrument,
                no_prometheus,
            } => {
                assert_eq!(config, Some(PathBuf::from("fixtures/experiment.toml")));
                assert!(no_instrument);
                assert!(!no_prometheus);
            }
            Commands::Plan { .. } => panic!("expected the run subcommand"),
        }
        Ok(())
    }

    #[test]
    fn explicit_config_path_wins() {
        assert_eq!(
            config_path(Some(PathBuf::from("other.toml"))),
            PathBuf::from("other.toml")
        );
    }
}
