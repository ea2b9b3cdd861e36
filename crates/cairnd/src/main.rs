//! cairnd — cairn overlay daemon.
//!
//! Loads configuration, brings a [`Host`] up on the configured port, and
//! runs until interrupted. All interesting behavior lives in `cairn-host`;
//! this binary is wiring.

use anyhow::{Context, Result};

use cairn_core::config::CairnConfig;
use cairn_core::identity::FileIdentityStore;
use cairn_host::Host;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = CairnConfig::write_default_if_missing()
        .context("writing default configuration")?;
    let config = CairnConfig::load().context("loading configuration")?;
    tracing::info!(path = %config_path.display(), "configuration loaded");

    let store = FileIdentityStore::new(&config.network.data_dir);
    let host = Host::new(config.client_version.clone(), config.network.clone(), &store)
        .context("building host")?;

    host.start().context("starting host")?;
    tracing::info!(
        id = %host.id(),
        address = %host.listen_address(),
        port = host.listen_port(),
        "cairnd running"
    );

    wait_for_shutdown()?;
    tracing::info!("interrupt received; draining");
    host.stop().context("stopping host")?;
    Ok(())
}

/// Block the main thread until ctrl-c. The Host owns its own runtime, so a
/// minimal single-threaded one is enough here.
fn wait_for_shutdown() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("waiting for ctrl-c")
}
