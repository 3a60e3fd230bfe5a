//! Offload worker - runs one code unit invocation for an offload host.
//!
//! Started by the host with the unit's library path and an optional
//! comma-separated list of preload libraries. The host channel arrives as an
//! inherited descriptor named by `OFFLOAD_CHANNEL_FD`.

use std::process::ExitCode;

use clap::Parser;
use offload_core::logging;
use offload_core::worker::{self, DylibLoader, WorkerArgs};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let args = WorkerArgs::parse();
    logging::init();
    tracing::debug!("Worker starting for '{}'", args.target);

    let code = worker::run(&args, DylibLoader::new()).await?;
    Ok(ExitCode::from(code as u8))
}
