#![forbid(unsafe_code)]

mod cli;
mod commands;
mod reload;
mod shutdown;
mod startup;

use anyhow::Result;

use cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();

    match cli.command {
        Some(Command::Version) => {
            println!("physnetd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Command::Validate) => commands::cmd_validate(&cli),
        Some(Command::Apply) => commands::cmd_apply(&cli).await,
        // No subcommand = run the daemon
        Some(Command::Run) | None => startup::run(&cli).await,
    }
}
