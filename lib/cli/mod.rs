use crate::build_info;
use crate::commands::{CheckConfigArgs, ExportArgs};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    about = "Streams committed export blocks to sink targets",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Route sources to their targets and pump blocks until shutdown
    Run(ExportArgs),
    /// Load and validate an export config, then print the table routes
    CheckConfig(CheckConfigArgs),
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command};
    use crate::build_info;
    use clap::{error::ErrorKind, Parser};

    #[test]
    fn version_short_circuits_other_flags() {
        let err = Cli::try_parse_from([
            "export_streamer",
            "--version",
            "--this-flag-does-not-exist",
        ])
        .expect_err("expected clap to stop parsing after --version");

        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        assert!(
            err.to_string().contains(build_info::VERSION_WITH_COMMIT),
            "version output should include semver+commit hash"
        );
    }

    #[test]
    fn run_subcommand_collects_members() {
        let cli = Cli::try_parse_from([
            "export_streamer",
            "run",
            "--config",
            "export.json",
            "--member",
            "host-a:21212",
            "--member",
            "host-b:21212",
            "--exit-when-drained",
        ])
        .expect("parse run");

        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.members, vec!["host-a:21212", "host-b:21212"]);
                assert!(args.exit_when_drained);
                assert_eq!(args.log_level, "info");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
