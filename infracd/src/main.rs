//! `infracd` command line.
//!
//! Without a subcommand a single run is performed with the configured command.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use infracd::exit_codes;
use infracd::io::config::{config_path, load_config};
use infracd::io::terraform::TerraformCli;
use infracd::logging;
use infracd::run::execute;

#[derive(Parser)]
#[command(
    name = "infracd",
    version,
    about = "Continuous delivery runner for terraform configurations"
)]
struct Cli {
    /// Configuration file. Defaults to `$INFRACD_CONFIG_FILE`, then `config.yml`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum CliCommand {
    /// Run the configured command once (default).
    Run,
    /// Load and validate the configuration, then exit.
    Validate,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let path = config_path(cli.config.as_deref());
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(err) => {
            error!(config = %path.display(), err = %format!("{err:#}"), "invalid configuration");
            return exit_codes::FAILURE;
        }
    };

    match cli.command.unwrap_or(CliCommand::Run) {
        CliCommand::Validate => {
            info!(config = %path.display(), "configuration is valid");
            exit_codes::OK
        }
        CliCommand::Run => execute(&config, &TerraformCli::new(&config.terraform_path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default_subcommand() {
        let cli = Cli::parse_from(["infracd"]);
        assert_eq!(cli.command, None);
        assert_eq!(cli.config, None);
    }

    #[test]
    fn parse_validate_with_config() {
        let cli = Cli::parse_from(["infracd", "validate", "--config", "/etc/infracd.yml"]);
        assert_eq!(cli.command, Some(CliCommand::Validate));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/infracd.yml")));
    }

    #[test]
    fn invalid_config_exits_with_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.yml");
        std::fs::write(&path, "command: deploy\n").expect("write");
        let cli = Cli {
            config: Some(path),
            command: Some(CliCommand::Validate),
        };
        assert_eq!(run(cli), exit_codes::FAILURE);
    }
}
