use std::{path::PathBuf, sync::OnceLock};

use clap::{Parser, Subcommand};

use crate::deploy::model::DeployMode;

/// Zero-downtime releases for compose projects.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "relevo.toml", global = true)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Deploy the latest revision of a repository.
    Deploy {
        /// URL of the repository to clone.
        repo_url: String,
        /// Overrides the mode set in the config file.
        #[arg(short, long, value_enum)]
        mode: Option<DeployMode>,
        /// Project name. Defaults to the repository name.
        #[arg(short, long)]
        project: Option<String>,
    },
    /// Check that docker, docker compose and git are available.
    Check,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_arguments() {
        let args = Args::parse_from([
            "relevo",
            "deploy",
            "https://example.com/acme/shop.git",
            "--mode",
            "simple",
            "--config",
            "/etc/relevo.toml",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/relevo.toml"));
        match args.command {
            Command::Deploy {
                repo_url,
                mode,
                project,
            } => {
                assert_eq!(repo_url, "https://example.com/acme/shop.git");
                assert_eq!(mode, Some(DeployMode::Simple));
                assert_eq!(project, None);
            }
            Command::Check => panic!("expected deploy"),
        }
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["relevo", "check"]);
        assert_eq!(args.config, PathBuf::from("relevo.toml"));
        assert!(matches!(args.command, Command::Check));

        let args = Args::parse_from(["relevo", "deploy", "u", "-m", "blue-green"]);
        assert!(matches!(
            args.command,
            Command::Deploy {
                mode: Some(DeployMode::BlueGreen),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Args::try_parse_from(["relevo", "deploy", "u", "--mode", "rolling"]).is_err());
    }
}
