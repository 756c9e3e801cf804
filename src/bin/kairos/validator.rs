use std::path::PathBuf;

use miette::Result;

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

    kairos::validator::run(domain, config.validator.clone(), cancel).await?;

    Ok(())
}
