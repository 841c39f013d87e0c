pub mod config;
pub mod observer;
pub mod server;

use std::sync::Arc;

use self::{config::Config, observer::Observer};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "webtransport-server.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let the integration tests directly use the server crate and
/// start the server, a function is opened to replace the main function to
/// directly start the server.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    log::info!("{} starting", SOFTWARE);

    let server = server::start(&config, &Observer::new()).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received, stopping");

    server.shutdown().await;
    Ok(())
}
