use std::path::PathBuf;

use miette::{Context as _, IntoDiagnostic};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::{filter::Targets, prelude::*};

use kairos::adapters::DomainAdapter;
use kairos::prelude::*;
use kairos_core::config::{LoggingConfig, RootConfig};

/// Layer every given config file (later files win) into the root config.
/// With no positional paths, `PTO_CONFIG_FILES` is consulted.
pub fn load_config(config_files: &[PathBuf]) -> miette::Result<RootConfig> {
    let mut paths: Vec<PathBuf> = config_files.to_vec();

    if paths.is_empty() {
        if let Ok(from_env) = std::env::var("PTO_CONFIG_FILES") {
            paths = from_env.split(':').map(PathBuf::from).collect();
        }
    }

    let mut builder = ::config::Config::builder();

    for path in &paths {
        builder = builder.add_source(::config::File::from(path.as_path()));
    }

    builder
        .build()
        .into_diagnostic()
        .context("loading config files")?
        .try_deserialize()
        .into_diagnostic()
        .context("deserializing config")
}

pub fn open_domain(config: &RootConfig) -> Result<DomainAdapter, Error> {
    std::fs::create_dir_all(&config.storage.path)?;

    let store = kairos_redb::Store::open(config.storage.path.join("kairos.redb"))
        .map_err(|e| Error::ConfigError(format!("opening store: {e}")))?;

    Ok(DomainAdapter::new(store, &config.environment))
}

pub fn setup_tracing(config: &LoggingConfig) -> miette::Result<()> {
    let level = config.max_level;

    let filter = Targets::new()
        .with_target("kairos", level)
        .with_default(Level::WARN);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .finish()
        .with(filter)
        .init();

    Ok(())
}

/// Cancellation token wired to ctrl-c.
pub fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            trigger.cancel();
        }
    });

    cancel
}
