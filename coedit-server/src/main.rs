//! coedit server: hosts collaborative documents over WebSockets.
//!
//! Configuration comes from flags, then `COEDIT_*`/`CRDT_ENGINE`/... env
//! variables, then defaults. Logging is controlled with `RUST_LOG`.

mod cli;

use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use coedit_collab::{CollabConfig, SyncServer};
use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match CollabConfig::from_env() {
        Ok(config) => cli.apply(config),
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "Starting coedit server: engine={}, max_documents={}, max_document_bytes={}, idle_ttl={:?}",
        config.engine, config.max_documents, config.max_document_bytes, config.idle_ttl
    );

    let server = SyncServer::new(config);
    let sweeper = server.registry().spawn_sweeper();

    let code = tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Server failed: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            ExitCode::SUCCESS
        }
    };

    sweeper.abort();
    code
}
