pub mod chunker;
pub mod cli;
pub mod dispatcher;
pub mod errors;
pub mod external_tools;
pub mod fifo;
pub mod formats;
pub mod input;
pub mod pipeline;
pub mod spool;
pub mod tool_args;

use cli::PileupDriverArgs;
use errors::Result;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Logging goes to stderr; the final data stream may own stdout.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

pub fn run_from_args(args: PileupDriverArgs) -> Result<()> {
    pipeline::run(&args)
}
