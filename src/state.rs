//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::StatusCache;
use crate::config::Config;
use crate::correlation::Correlator;
use crate::gateway::SmsGateway;
use crate::hub::Hub;
use crate::outbox::{EventPublisher, Outbox};
use crate::router::MessageRouter;
use crate::store::Store;

/// Shared application state for the hub server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Handle to the connection registry task.
    pub hub: Hub,
    pub store: Arc<dyn Store>,
    pub status_cache: Arc<dyn StatusCache>,
    pub outbox: Outbox,
    pub correlator: Correlator,
    /// Dispatches decoded device frames to their handlers.
    pub router: Arc<MessageRouter>,
    /// Command-sender service for SMS, USSD and device control.
    pub gateway: Arc<SmsGateway>,
    /// Process-wide shutdown signal. Cancelling it closes every connection
    /// and drains the outbox.
    pub shutdown: CancellationToken,
}

/// Background tasks owned by an [`AppState`].
pub struct Tasks {
    pub hub: JoinHandle<()>,
    pub outbox: JoinHandle<()>,
}

impl Tasks {
    /// Wait for the hub and outbox workers to finish after shutdown.
    pub async fn join(self) {
        let _ = self.hub.await;
        let _ = self.outbox.await;
    }
}

impl AppState {
    /// Wire the hub, outbox, correlator, router and gateway around the given
    /// collaborators and spawn their worker tasks.
    pub fn build(
        config: Config,
        store: Arc<dyn Store>,
        status_cache: Arc<dyn StatusCache>,
        publisher: Arc<dyn EventPublisher>,
    ) -> (Self, Tasks) {
        let shutdown = CancellationToken::new();
        let (hub, hub_task) = Hub::spawn(&config.hub, status_cache.clone(), shutdown.clone());
        let (outbox, outbox_task) =
            Outbox::spawn(publisher, config.outbox.capacity, shutdown.clone());
        let correlator = Correlator::new(store.clone());
        let router = Arc::new(MessageRouter::new(
            store.clone(),
            outbox.clone(),
            correlator.clone(),
        ));
        let gateway = Arc::new(SmsGateway::new(
            hub.clone(),
            store.clone(),
            correlator.clone(),
            outbox.clone(),
            config.selector.clone(),
        ));

        let state = Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            hub,
            store,
            status_cache,
            outbox,
            correlator,
            router,
            gateway,
            shutdown,
        };
        let tasks = Tasks {
            hub: hub_task,
            outbox: outbox_task,
        };
        (state, tasks)
    }
}
