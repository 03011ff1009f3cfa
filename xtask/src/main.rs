// Licensed under the Apache-2.0 license

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

mod precheckin;

#[derive(Parser)]
#[command(about = "Workspace task runner")]
struct Xtask {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run format check, clippy and all tests.
    Precheckin,
    /// Check formatting.
    Format,
    /// Run clippy over the workspace.
    Clippy,
    /// Run all tests.
    Test,
}

fn main() -> Result<()> {
    match Xtask::parse().command {
        Commands::Precheckin => precheckin::precheckin(),
        Commands::Format => precheckin::format(),
        Commands::Clippy => precheckin::clippy(),
        Commands::Test => precheckin::test(),
    }
}

/// Runs `cargo` with the given arguments from the workspace root.
pub(crate) fn cargo(args: &[&str]) -> Result<()> {
    let status = std::process::Command::new(env!("CARGO"))
        .args(args)
        .status()?;
    if !status.success() {
        bail!("cargo {} failed", args.join(" "));
    }
    Ok(())
}
