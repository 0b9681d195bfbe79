use anyhow::Result;
use clap::{Parser, Subcommand};
use motion_core::TrackerRegistry;

use crate::vision::{self, LineCamConfig, RunArgs};

#[derive(Parser, Debug)]
#[command(name = "linecam", version, about = "Line-crossing motion detector")]
pub struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Capture, detect crossings and publish them to the collector.
    Run(RunArgs),
    /// List the registered tracker backends.
    Trackers,
}

pub fn handle_commands(cli: Cli) -> Result<()> {
    match cli.command {
        CliCommand::Run(args) => vision::run(LineCamConfig::try_from(args)?),
        CliCommand::Trackers => {
            let registry = TrackerRegistry::with_defaults();
            let default = registry.default_backend().map(|backend| backend.name());
            for name in registry.names() {
                let marker = if Some(name) == default { " (default)" } else { "" };
                println!("{name}{marker}");
            }
            Ok(())
        }
    }
}
