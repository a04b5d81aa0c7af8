//! Replicator binary.
//!
//! Loads configuration, initializes telemetry and runs the replication of every configured
//! table until it finishes, fails, or the process is asked to stop.

use std::process::ExitCode;
use std::sync::Once;

use clap::Parser;
use dwsync_config::shared::ReplicatorConfig;
use dwsync_telemetry::metrics::init_metrics;
use dwsync_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::{Args, load_replicator_config};
use crate::core::start_replicator_with_config;
use crate::error::{ReplicatorError, ReplicatorResult};

mod config;
mod core;
mod error;

static INIT_CRYPTO: Once = Once::new();

/// Installs the aws-lc-rs rustls provider once.
///
/// Feature unification enables more than one rustls provider, so one has to be selected.
fn install_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("a rustls crypto provider is already installed");
        }
    });
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", err.render_report());
            ExitCode::FAILURE
        }
    }
}

fn run() -> ReplicatorResult<()> {
    let args = Args::parse();
    let replicator_config = load_replicator_config(args)?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(ReplicatorError::config)?;

    install_crypto_provider();

    init_metrics(None).map_err(ReplicatorError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))
}

async fn async_main(replicator_config: ReplicatorConfig) -> ReplicatorResult<()> {
    if let Err(err) = start_replicator_with_config(replicator_config).await {
        error!("{err}");
        return Err(err);
    }

    Ok(())
}
