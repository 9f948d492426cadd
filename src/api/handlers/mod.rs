pub mod admin;
pub mod endpoint;

use std::sync::Arc;

use crate::services::config_loader::ConfigHandle;
use crate::services::{ConnectionManager, QueryExecutor, QueryResultCache};

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigHandle>,
    pub connections: Arc<ConnectionManager>,
    pub cache: Arc<QueryResultCache>,
    pub executor: Arc<QueryExecutor>,
}

impl AppState {
    pub fn new(config: Arc<ConfigHandle>, connections: Arc<ConnectionManager>, cache: Arc<QueryResultCache>) -> Self {
        let executor = Arc::new(QueryExecutor::new(config.clone(), connections.clone(), cache.clone()));
        Self {
            config,
            connections,
            cache,
            executor,
        }
    }
}
