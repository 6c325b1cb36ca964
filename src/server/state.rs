//! Application state shared across handlers.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::library::PageRequest;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration, immutable after startup.
    pub config: Arc<Config>,
    /// Read-only catalog handle.
    pub catalog: Catalog,
}

impl AppState {
    /// Create application state from resolved configuration.
    pub fn new(config: Config) -> Self {
        let catalog = Catalog::from_config(&config.catalog);
        Self::with_catalog(config, catalog)
    }

    /// Create application state around an existing catalog handle.
    pub fn with_catalog(config: Config, catalog: Catalog) -> Self {
        Self {
            config: Arc::new(config),
            catalog,
        }
    }

    /// Get the base URL for generating links.
    pub fn base_url(&self) -> &str {
        &self.config.server.base_url
    }

    /// Configured page size.
    pub fn page_size(&self) -> u32 {
        self.config.feed.page_size
    }

    /// Page request from an optional 0-based offset or 1-based page number.
    /// An explicit offset wins.
    pub fn page_request(&self, offset: Option<u32>, page: Option<u32>) -> PageRequest {
        let limit = self.page_size();
        match (offset, page) {
            (Some(offset), _) => PageRequest::new(offset, limit),
            (None, Some(page)) => PageRequest::from_page_number(page, limit),
            (None, None) => PageRequest::new(0, limit),
        }
    }
}
