//! Capture server entry point.
//!
//! One positional argument selects the listening endpoint: `version`
//! prints the server version, a bare number is a TCP port, and
//! `unix:<path>` serves on a Unix-domain socket.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use cxcapture::server::{CaptureServer, Endpoint, SERVER_VERSION};
use cxcapture::{logging, Settings};

#[derive(Parser)]
#[command(name = "cxcapture-server", disable_version_flag = true)]
struct Cli {
    /// `version`, a TCP port (1-65535), or `unix:<path>`.
    endpoint: String,

    /// Settings file (default: cxcapture.toml next to the binary).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.endpoint == "version" {
        println!("{SERVER_VERSION}");
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let endpoint = Endpoint::parse(&cli.endpoint)
        .with_context(|| format!("invalid endpoint argument '{}'", cli.endpoint))?;

    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    logging::init(&settings.server.log_level);

    let server = CaptureServer::from_settings(settings).context("building capture server")?;
    server.serve(&endpoint).context("serving")?;
    Ok(())
}
