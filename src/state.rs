use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::backend::{Backend, LocalBackend};
use crate::config::Config;

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    /// Set when running on the embedded backend, whose blobs the router serves
    pub local: Option<LocalBackend>,
    pub config: Config,
}

impl AppState {
    pub fn local(backend: LocalBackend, config: Config) -> Self {
        Self {
            backend: Arc::new(backend.clone()),
            local: Some(backend),
            config,
        }
    }

    pub fn hosted(backend: Arc<dyn Backend>, config: Config) -> Self {
        Self {
            backend,
            local: None,
            config,
        }
    }
}
