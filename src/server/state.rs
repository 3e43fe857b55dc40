use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::lifecycle::Lifecycle;
use crate::proxy::Proxy;
use crate::settings::Settings;
use crate::store::{ConfigStore, FunctionStore};
use crate::substrate::Substrate;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<Lifecycle>,
    /// Direct read handle for the unauthenticated `/serve` path.
    pub functions: Arc<dyn FunctionStore>,
    pub substrate: Arc<dyn Substrate>,
    pub proxy: Proxy,
    served_requests: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        functions: Arc<dyn FunctionStore>,
        configs: Arc<dyn ConfigStore>,
        substrate: Arc<dyn Substrate>,
    ) -> Self {
        let proxy = Proxy::new(&settings.service_prefix, settings.service_port);
        let lifecycle = Arc::new(Lifecycle::new(
            functions.clone(),
            configs,
            substrate.clone(),
            settings,
        ));

        Self {
            lifecycle,
            functions,
            substrate,
            proxy,
            served_requests: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count one proxied `/serve` request.
    pub fn record_served(&self) {
        self.served_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn served_count(&self) -> u64 {
        self.served_requests.load(Ordering::Relaxed)
    }
}
