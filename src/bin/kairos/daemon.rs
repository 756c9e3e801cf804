use std::path::PathBuf;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use miette::{IntoDiagnostic, Result};
use tracing::warn;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Configuration files, deep-merged in order.
    #[clap(required = true)]
    config_files: Vec<PathBuf>,
}

#[tokio::main]
pub async fn run(args: &Args) -> Result<()> {
    let config = crate::common::load_config(&args.config_files)?;
    crate::common::setup_tracing(&config.logging)?;

    let domain = crate::common::open_domain(&config)?;
    let cancel = crate::common::shutdown_token();

    let mut drivers = FuturesUnordered::new();

    drivers.push(tokio::spawn(kairos::sensor::run(
        domain.clone(),
        cancel.clone(),
    )));

    drivers.push(tokio::spawn(kairos::supervisor::run(
        domain.clone(),
        config.supervisor.clone(),
        config.data_service.clone(),
        cancel.clone(),
    )));

    drivers.push(tokio::spawn(kairos::validator::run(
        domain,
        config.validator.clone(),
        cancel.clone(),
    )));

    while let Some(joined) = drivers.next().await {
        match joined.into_diagnostic()? {
            Ok(()) => {}
            Err(error) => {
                warn!(%error, "driver failed, shutting down");
                cancel.cancel();
                return Err(error.into());
            }
        }
    }

    Ok(())
}
