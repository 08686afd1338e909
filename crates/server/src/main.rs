//! Colony relay server
//!
//! Collects turtle reports from the bridge over HTTP and fans colony state
//! out to observers on a persistent framed channel.

mod api;
mod channel;
mod colony;
mod commands;
mod config;
mod dispatcher;
mod frame;
mod handshake;
mod logging;
mod registry;

use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::dispatcher::DispatcherHandle;
use crate::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let _logging = init_logging(config.log_dir.as_deref())?;

    info!(
        component = "server",
        event = "server.starting",
        colony = %config.colony_name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting colony relay"
    );

    let dispatcher = DispatcherHandle::spawn(config.dispatch_settings());

    let channel_addr = config.channel_addr();
    let channel_listener = TcpListener::bind(channel_addr).await?;
    info!(
        component = "server",
        event = "server.channel.listening",
        addr = %channel_addr,
        "Channel listening"
    );
    tokio::spawn(channel::serve(
        channel_listener,
        dispatcher.clone(),
        config.channel_settings(),
    ));

    let app = api::router(dispatcher)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let http_addr = config.http_addr();
    let listener = TcpListener::bind(http_addr).await?;
    info!(
        component = "server",
        event = "server.http.listening",
        addr = %http_addr,
        "HTTP API listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
