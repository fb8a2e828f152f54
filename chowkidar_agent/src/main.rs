//! chowkidar_agent: host metrics over REST and WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chowkidar_agent::api::{router, Limiters};
use chowkidar_agent::auth::{default_key_path, resolve_secret, TokenAuthority};
use chowkidar_agent::config::Config;
use chowkidar_agent::process::platform_source;
use chowkidar_agent::provider::SysinfoProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let secret = resolve_secret(config.secret_key.as_deref(), &default_key_path())
        .context("loading secret key")?;
    let auth = TokenAuthority::new(&secret, config.token_ttl(), config.server_name.clone());

    if config.print_token {
        let token = auth.issue().context("signing token")?;
        println!("{token}");
        return Ok(());
    }

    let bind = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;

    let state = chowkidar_agent::start(
        &config,
        Arc::new(SysinfoProvider::new()),
        platform_source(),
        auth,
    );
    let app = router(
        state.clone(),
        Limiters::new(
            config.rate_limit_rps,
            config.rate_limit_burst,
            config.rate_limit_max_clients,
        ),
    );

    info!(
        server = %config.server_name,
        "agent listening on http://{} (ws: /ws?token=...)",
        config.display_address()
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    chowkidar_agent::stop(&state).await;
    if let Err(e) = &served {
        error!("server error: {e}");
    }
    served.context("serving")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
