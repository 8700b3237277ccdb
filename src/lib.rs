pub mod config;
pub mod logging;
pub mod storage;

use std::sync::Arc;

use anyhow::Context;
use dimse::{DimseScp, Providers};

use crate::config::Config;
use crate::storage::FilesystemStorage;

/// Providers backed by the configured storage root
pub fn providers(config: &Config) -> anyhow::Result<Providers> {
    let storage = FilesystemStorage::new(&config.storage.root)
        .with_context(|| format!("cannot open storage root {}", config.storage.root.display()))?;
    let storage = Arc::new(storage);
    Ok(Providers::new()
        .with_storage(storage.clone())
        .with_find(storage.clone())
        .with_retrieve(storage))
}

/// Builds the SCP described by `config` without starting it.
pub fn build_scp(config: &Config) -> anyhow::Result<DimseScp> {
    let scp = DimseScp::new(config.dimse.clone(), providers(config)?)?
        .with_directory(Arc::new(config.directory()));
    Ok(scp)
}

/// Runs the node until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    logging::init(&config)?;

    tracing::info!("Starting dicom-node '{}'", config.node.id);
    tracing::info!(
        "AE title {}, storage root {}, {} remote node(s)",
        config.dimse.local_aet,
        config.storage.root.display(),
        config.remotes.len()
    );

    let scp = build_scp(&config)?;
    let shutdown = scp.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    scp.run().await?;
    Ok(())
}
