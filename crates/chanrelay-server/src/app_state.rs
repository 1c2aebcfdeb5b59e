//! Shared state for the ops HTTP surface.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::obs::RelayMetrics;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cfg: RelayConfig,
    metrics: Arc<RelayMetrics>,
}

impl AppState {
    pub fn new(cfg: RelayConfig) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                cfg,
                metrics: Arc::new(RelayMetrics::default()),
            }),
        }
    }

    pub fn cfg(&self) -> &RelayConfig {
        &self.inner.cfg
    }

    /// The registry the relay engine reports into.
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.metrics.is_draining()
    }

    /// Flip `/readyz` to 503 ahead of shutdown.
    pub fn begin_draining(&self) {
        self.inner.metrics.set_draining();
    }
}
