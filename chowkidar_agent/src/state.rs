//! Shared agent state handed to every handler.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::TokenAuthority;
use crate::cache::MetricsCache;
use crate::history::HistoryCollector;
use crate::hub::HubHandle;
use crate::process::ProcessRanker;
use crate::security::OriginPolicy;

/// Cheap to clone; every component is constructed once at startup.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<MetricsCache>,
    pub history: Arc<HistoryCollector>,
    pub processes: Arc<ProcessRanker>,
    pub hub: HubHandle,
    pub auth: Arc<TokenAuthority>,
    pub origins: Arc<OriginPolicy>,
    pub started: Instant,
}
