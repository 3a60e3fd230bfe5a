//! Worker side: load one code unit, run it once, report, exit.
//!
//! A worker binary parses [`WorkerArgs`], picks a [`CodeUnitLoader`], and
//! hands both to [`run`]:
//!
//! ```ignore
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<ExitCode> {
//!     let args = WorkerArgs::parse();
//!     let code = offload_core::worker::run(&args, DylibLoader::new()).await?;
//!     Ok(ExitCode::from(code as u8))
//! }
//! ```

pub mod bootstrap;
pub mod dylib;
pub mod registry;
pub mod unit;

use clap::Parser;

use crate::error::{Error, Result};
use crate::rpc::channel;

pub use bootstrap::{EXIT_FAILURE, EXIT_SUCCESS, Phase, serve};
pub use dylib::DylibLoader;
pub use registry::UnitRegistry;
pub use unit::{CodeUnit, CodeUnitLoader, UnitFuture};

/// Command line of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(
    name = "offload-worker",
    version,
    about = "Run one code unit invocation for an offload host"
)]
pub struct WorkerArgs {
    /// Code unit to load and invoke.
    pub target: String,

    /// Comma-separated modules to load, in order, before the target.
    #[arg(default_value = "")]
    pub preload: String,
}

impl WorkerArgs {
    /// Preload modules in order; empty entries are skipped.
    pub fn preload_modules(&self) -> Vec<String> {
        self.preload
            .split(',')
            .map(str::trim)
            .filter(|module| !module.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Load every module in `modules`, stopping at the first failure.
pub fn preload_all(loader: &mut dyn CodeUnitLoader, modules: &[String]) -> Result<()> {
    for module in modules {
        loader.preload(module).map_err(|source| Error::Preload {
            module: module.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Run a worker process: preload, open the inherited channel, serve.
///
/// A preload failure is returned before the channel is touched, so the
/// process can abort with it and the host observes a failed exit.
pub async fn run<L>(args: &WorkerArgs, mut loader: L) -> Result<i32>
where
    L: CodeUnitLoader + 'static,
{
    preload_all(&mut loader, &args.preload_modules())?;
    let stream = channel::inherited()?;
    tracing::debug!("Worker for '{}' connected", args.target);
    serve(stream, args.target.clone(), loader).await
}
