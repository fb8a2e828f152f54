//! Library surface for the agent (modules + a startup helper used by main and tests).

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod duration;
pub mod error;
pub mod history;
pub mod hub;
pub mod process;
pub mod provider;
pub mod rate;
pub mod security;
pub mod state;
pub mod types;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::auth::TokenAuthority;
use crate::cache::MetricsCache;
use crate::config::Config;
use crate::history::HistoryCollector;
use crate::hub::Hub;
use crate::process::{ProcessRanker, ProcessSource};
use crate::provider::SharedProvider;
use crate::security::OriginPolicy;
use crate::state::AppState;

/// Builds every component and starts the background loops (history, ranking, hub).
/// Must be called inside a tokio runtime.
pub fn start(
    config: &Config,
    provider: SharedProvider,
    source: Box<dyn ProcessSource>,
    auth: TokenAuthority,
) -> AppState {
    let cache = Arc::new(MetricsCache::with_ttls(
        provider.clone(),
        config.cache_ttl(),
        config.dir_cache_ttl(),
    ));

    let history = Arc::new(HistoryCollector::new(provider, config.history_capacity));
    history.start(config.history_interval());

    let processes = Arc::new(ProcessRanker::new(source, config.process_limit));
    processes.start(config.process_interval());

    let (hub, _) = Hub::spawn(cache.clone(), processes.clone(), config.hub());
    let origins = OriginPolicy::new(config.cors_origins());

    info!(
        cache_ttl = ?config.cache_ttl(),
        history_interval = ?config.history_interval(),
        process_interval = ?config.process_interval(),
        cors_origins = ?origins.origins(),
        "agent components started"
    );

    AppState {
        cache,
        history,
        processes,
        hub,
        auth: Arc::new(auth),
        origins: Arc::new(origins),
        started: Instant::now(),
    }
}

/// Stops the periodic loops and the hub. Each step is idempotent.
pub async fn stop(state: &AppState) {
    state.history.stop();
    state.processes.stop();
    state.hub.shutdown().await;
}
