//! Host-side container: registers generations, drives their lifecycle and
//! routes page traffic to the active worker.

use std::sync::Arc;

use countdown_core::WorkerConfig;
use countdown_net::{Fetch, Request, Response};
use hashbrown::HashMap;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::Client;
use crate::event::{EventOutcome, HandlerTable, Lifetime, WorkerEvent};
use crate::lifecycle::{ServiceWorkerRegistration, ServiceWorkerState};
use crate::message::{ClientMessage, MessageEvent, ReplyPort};
use crate::push::{NotificationId, PushMessage};
use crate::sync::SyncOutcome;
use crate::worker::{OfflineWorker, WorkerScope};
use crate::{Result, ServiceWorkerError};

/// Events reported to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A new generation started installing.
    UpdateFound { generation: String },
    /// A worker changed state.
    StateChange {
        generation: String,
        state: ServiceWorkerState,
    },
    /// Pages are now controlled by this generation.
    ControllerChange { generation: String },
}

/// A generation's worker together with its handler table.
#[derive(Clone)]
struct WorkerSlot {
    worker: Arc<OfflineWorker>,
    handlers: HandlerTable,
}

impl WorkerSlot {
    fn new(worker: Arc<OfflineWorker>) -> Self {
        let handlers = worker.handlers();
        Self { worker, handlers }
    }
}

/// Service worker container for one scope.
pub struct ServiceWorkerContainer {
    scope: WorkerScope,

    /// Workers by generation.
    workers: Arc<RwLock<HashMap<String, WorkerSlot>>>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ContainerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        caches: CacheStorage,
        network: Arc<dyn Fetch>,
        scope: Url,
    ) -> (Self, mpsc::UnboundedReceiver<ContainerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                scope: WorkerScope::new(caches, network, scope),
                workers: Arc::new(RwLock::new(HashMap::new())),
                event_tx,
            },
            event_rx,
        )
    }

    /// State shared with every worker.
    pub fn scope(&self) -> &WorkerScope {
        &self.scope
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.scope.caches
    }

    /// Snapshot of the registration slots.
    pub async fn registration(&self) -> ServiceWorkerRegistration {
        self.scope.registration.read().await.clone()
    }

    fn emit(&self, event: ContainerEvent) {
        // the host may not be listening
        let _ = self.event_tx.send(event);
    }

    fn state_change(&self, generation: &str, state: ServiceWorkerState) {
        self.emit(ContainerEvent::StateChange {
            generation: generation.to_string(),
            state,
        });
    }

    // ==================== Lifecycle ====================

    /// Register a generation: install it, then activate it when eligible.
    ///
    /// Returns the state the new worker ended in. Re-registering the active
    /// generation does nothing. A registration overtaken by a newer one while
    /// installing ends `Redundant`.
    pub async fn register(&self, config: WorkerConfig) -> Result<ServiceWorkerState> {
        config.validate()?;
        let generation = config.generation.clone();
        let bucket = config.bucket_name();

        if self.scope.registration.read().await.active_generation() == Some(generation.as_str()) {
            debug!(generation = %generation, "Generation already active");
            return Ok(ServiceWorkerState::Activated);
        }

        let slot = WorkerSlot::new(OfflineWorker::new(config, self.scope.clone())?);

        let id = self.scope.registration.write().await.begin_install(&generation);
        info!(generation = %generation, "Installing");
        self.emit(ContainerEvent::UpdateFound {
            generation: generation.clone(),
        });
        self.state_change(&generation, ServiceWorkerState::Installing);

        if let Err(e) = slot.handlers.dispatch(WorkerEvent::Install).settled().await {
            error!(generation = %generation, error = %e, "Install failed");
            if self
                .scope
                .registration
                .write()
                .await
                .install_failed(id, &e.to_string())
                .is_none()
            {
                debug!(generation = %generation, "Failed install was already superseded");
            }
            self.state_change(&generation, ServiceWorkerState::Redundant);
            return Err(match e {
                ServiceWorkerError::InstallFailed(_) => e,
                other => ServiceWorkerError::InstallFailed(other.to_string()),
            });
        }

        // reachable before the record can be promoted and activated
        self.workers.write().await.insert(generation.clone(), slot);
        if !self.scope.registration.write().await.install_complete(id) {
            info!(generation = %generation, "Install superseded by a newer registration");
            self.discard(&generation, &bucket).await;
            self.state_change(&generation, ServiceWorkerState::Redundant);
            return Ok(ServiceWorkerState::Redundant);
        }
        self.state_change(&generation, ServiceWorkerState::Installed);

        self.try_activate().await?;
        let registration = self.scope.registration.read().await;
        let state = [&registration.active, &registration.waiting]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
            .map(|w| w.state)
            .unwrap_or(ServiceWorkerState::Redundant);
        Ok(state)
    }

    /// Drop the worker and bucket of a superseded generation, unless the
    /// registration still holds that generation in another slot.
    async fn discard(&self, generation: &str, bucket: &str) {
        if self.scope.registration.read().await.holds(generation) {
            return;
        }
        self.workers.write().await.remove(generation);
        match self.scope.caches.delete(bucket).await {
            Ok(true) => debug!(bucket, "Deleted bucket of superseded install"),
            Ok(false) => {}
            Err(e) => warn!(bucket, error = %e, "Could not delete bucket of superseded install"),
        }
    }

    /// Reinstate a generation whose bucket survived from an earlier run,
    /// without installing it again. Returns false if there is no such bucket.
    pub async fn resume(&self, config: WorkerConfig) -> Result<bool> {
        config.validate()?;
        if !self.scope.caches.has(&config.bucket_name()).await {
            return Ok(false);
        }

        let generation = config.generation.clone();
        let slot = WorkerSlot::new(OfflineWorker::new(config, self.scope.clone())?);
        self.workers.write().await.insert(generation.clone(), slot);
        self.scope.registration.write().await.restore(&generation);
        info!(generation = %generation, "Resumed active generation");
        Ok(true)
    }

    /// Activate the waiting worker if it is eligible, then any worker that
    /// became waiting meanwhile. Returns whether anything activated.
    pub async fn try_activate(&self) -> Result<bool> {
        let mut activated = false;
        while self.activate_waiting().await? {
            activated = true;
        }
        Ok(activated)
    }

    async fn activate_waiting(&self) -> Result<bool> {
        let (id, generation, slot, previous) = {
            let mut registration = self.scope.registration.write().await;
            let controlled = match registration.active_generation() {
                Some(active) => self.scope.clients.read().await.controlled_by(active),
                None => 0,
            };
            if !registration.can_activate(controlled) {
                return Ok(false);
            }
            let Some(generation) = registration.waiting.as_ref().map(|w| w.generation.clone()) else {
                return Ok(false);
            };

            // nothing changes unless the worker can actually run
            let slot = self
                .workers
                .read()
                .await
                .get(&generation)
                .cloned()
                .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker {generation}")))?;
            let (id, previous) = registration.begin_activation()?;
            (id, generation, slot, previous)
        };
        self.state_change(&generation, ServiceWorkerState::Activating);

        if let Err(e) = slot.handlers.dispatch(WorkerEvent::Activate).settled().await {
            error!(generation = %generation, error = %e, "Activate handler failed");
        }

        let previous_retired = {
            let mut registration = self.scope.registration.write().await;
            registration.activation_complete(id)?;
            previous.map(|p| {
                let held = registration.holds(&p.generation);
                (p, held)
            })
        };
        if let Some((previous, held)) = previous_retired {
            if !held {
                self.workers.write().await.remove(&previous.generation);
            }
            self.state_change(&previous.generation, ServiceWorkerState::Redundant);
        }

        info!(generation = %generation, "Activated");
        self.state_change(&generation, ServiceWorkerState::Activated);
        self.emit(ContainerEvent::ControllerChange { generation });
        Ok(true)
    }

    /// The worker controlling pages.
    pub async fn controller(&self) -> Option<Arc<OfflineWorker>> {
        self.active_slot().await.map(|slot| slot.worker)
    }

    async fn active_slot(&self) -> Option<WorkerSlot> {
        let generation = self
            .scope
            .registration
            .read()
            .await
            .active_generation()?
            .to_string();
        self.workers.read().await.get(&generation).cloned()
    }

    async fn waiting_slot(&self) -> Option<WorkerSlot> {
        let generation = self
            .scope
            .registration
            .read()
            .await
            .waiting
            .as_ref()?
            .generation
            .clone();
        self.workers.read().await.get(&generation).cloned()
    }

    async fn require_active(&self) -> Result<WorkerSlot> {
        self.active_slot()
            .await
            .ok_or_else(|| ServiceWorkerError::State("no active worker".to_string()))
    }

    // ==================== Clients ====================

    /// Open a page in scope, controlled by the active generation if there is one.
    pub async fn open_client(&self, url: Url) -> Client {
        let controller = self.scope.registration.read().await.active_generation().map(str::to_string);
        self.scope.clients.write().await.open_window(url, controller.as_deref())
    }

    // ==================== Fetch ====================

    /// Route a page request. Returns as soon as the response is known, along
    /// with the lifetime of any cache writes still running.
    pub async fn dispatch_fetch(&self, request: Request) -> Result<(Response, Lifetime)> {
        let Some(slot) = self.active_slot().await else {
            debug!(url = %request.url, "No controller, going to network");
            return Ok((self.scope.network.fetch(&request).await?, Lifetime::new()));
        };

        let (outcome, lifetime) = slot
            .handlers
            .dispatch(WorkerEvent::Fetch(request.clone()))
            .outcome()
            .await;

        match outcome? {
            EventOutcome::Response(response) => Ok((response, lifetime)),
            EventOutcome::Passthrough | EventOutcome::Unhandled => {
                Ok((self.scope.network.fetch(&request).await?, lifetime))
            }
            other => Err(ServiceWorkerError::State(format!(
                "fetch handler produced {other:?}"
            ))),
        }
    }

    /// Route a page request and wait for its cache writes to finish.
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        let (response, lifetime) = self.dispatch_fetch(request).await?;
        lifetime.settled().await;
        Ok(response)
    }

    // ==================== Sync / Push ====================

    /// Register a background sync tag.
    pub async fn register_sync(&self, tag: &str) {
        self.scope.sync.write().await.register(tag);
    }

    /// Fire a sync tag at the active worker.
    pub async fn fire_sync(&self, tag: &str) -> Result<SyncOutcome> {
        if !self.scope.sync.write().await.take(tag) {
            debug!(tag, "Firing sync tag that was not registered");
        }
        let slot = self.require_active().await?;
        match slot
            .handlers
            .dispatch(WorkerEvent::Sync {
                tag: tag.to_string(),
            })
            .settled()
            .await?
        {
            EventOutcome::Synced(outcome) => Ok(outcome),
            other => Err(ServiceWorkerError::State(format!(
                "sync handler produced {other:?}"
            ))),
        }
    }

    /// Deliver a push message. Returns the notification shown, if any.
    pub async fn push(&self, message: PushMessage) -> Result<Option<NotificationId>> {
        let slot = self.require_active().await?;
        match slot.handlers.dispatch(WorkerEvent::Push(message)).settled().await? {
            EventOutcome::NotificationShown(id) => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    /// Report a click on a notification. Returns the client focused or opened.
    pub async fn notification_click(
        &self,
        id: NotificationId,
        action: Option<&str>,
    ) -> Result<Option<String>> {
        let slot = self.require_active().await?;
        let event = WorkerEvent::NotificationClick {
            id,
            action: action.map(str::to_string),
        };
        match slot.handlers.dispatch(event).settled().await? {
            EventOutcome::NotificationClicked { client } => Ok(client),
            _ => Ok(None),
        }
    }

    // ==================== Messages ====================

    /// Post a message from a page to the active worker, or to the waiting one
    /// if nothing is active yet. `SKIP_WAITING` also retries activation.
    pub async fn post_message(&self, data: Value, port: Option<ReplyPort>) -> Result<()> {
        let slot = match self.active_slot().await {
            Some(slot) => slot,
            None => self
                .waiting_slot()
                .await
                .ok_or_else(|| ServiceWorkerError::State("no worker to receive message".to_string()))?,
        };

        let skip_waiting = matches!(ClientMessage::parse(&data), Ok(ClientMessage::SkipWaiting));
        let event = match port {
            Some(port) => MessageEvent::with_port(data, port),
            None => MessageEvent::new(data),
        };
        slot.handlers.dispatch(WorkerEvent::Message(event)).settled().await?;

        if skip_waiting {
            match self.try_activate().await {
                Ok(activated) => debug!(activated, "Skip-waiting processed"),
                Err(e) => warn!(error = %e, "Activation after skip-waiting failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use countdown_net::mock::MockNetwork;

    const ORIGIN: &str = "https://gaokao.test/";

    fn config(generation: &str) -> WorkerConfig {
        WorkerConfig {
            origin: Url::parse(ORIGIN).unwrap(),
            ..WorkerConfig::default()
        }
        .with_generation(generation)
    }

    fn online() -> Arc<MockNetwork> {
        let network = MockNetwork::new();
        for path in config("v1").precache {
            network.respond(&format!("https://gaokao.test{path}"), 200, format!("body of {path}"));
        }
        Arc::new(network)
    }

    fn container(network: Arc<MockNetwork>) -> (ServiceWorkerContainer, mpsc::UnboundedReceiver<ContainerEvent>) {
        ServiceWorkerContainer::new(CacheStorage::in_memory(), network, Url::parse(ORIGIN).unwrap())
    }

    #[tokio::test]
    async fn test_register_installs_and_activates() {
        let (container, mut events) = container(online());
        let state = container.register(config("v1")).await.unwrap();
        assert_eq!(state, ServiceWorkerState::Activated);

        let registration = container.registration().await;
        assert_eq!(registration.active_generation(), Some("v1"));
        assert!(registration.waiting.is_none());
        assert_eq!(container.controller().await.unwrap().generation(), "v1");

        assert_eq!(
            events.recv().await.unwrap(),
            ContainerEvent::UpdateFound {
                generation: "v1".to_string()
            }
        );
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen.last(),
            Some(&ContainerEvent::ControllerChange {
                generation: "v1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_reregister_active_generation_is_noop() {
        let network = online();
        let (container, _events) = container(network.clone());
        container.register(config("v1")).await.unwrap();
        let calls = network.call_count();

        assert_eq!(
            container.register(config("v1")).await.unwrap(),
            ServiceWorkerState::Activated
        );
        assert_eq!(network.call_count(), calls);
    }

    #[tokio::test]
    async fn test_without_controller_requests_go_to_network() {
        let network = Arc::new(MockNetwork::new().with_response("https://gaokao.test/api/quote", 200, "{}"));
        let (container, _events) = container(network.clone());

        let request = Request::get(Url::parse("https://gaokao.test/api/quote").unwrap());
        let response = container.fetch(request).await.unwrap();
        assert_eq!(response.text().unwrap(), "{}");
        assert!(container.caches().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_passthrough_request_reaches_network() {
        let network = online();
        network.respond("https://cdn.other.test/lib.js", 200, "lib");
        let (container, _events) = container(network.clone());
        container.register(config("v1")).await.unwrap();

        let request = Request::get(Url::parse("https://cdn.other.test/lib.js").unwrap());
        let response = container.fetch(request).await.unwrap();
        assert_eq!(response.text().unwrap(), "lib");
        assert_eq!(network.calls_to("https://cdn.other.test/lib.js"), 1);
        assert_eq!(container.caches().handle("gaokao-countdown-v1").len().await, 5);
    }

    #[tokio::test]
    async fn test_resume_requires_bucket() {
        let (container, _events) = container(Arc::new(MockNetwork::new()));
        assert!(!container.resume(config("v1")).await.unwrap());

        container.caches().open("gaokao-countdown-v1").await.unwrap();
        assert!(container.resume(config("v1")).await.unwrap());
        assert_eq!(container.controller().await.unwrap().generation(), "v1");
    }

    #[tokio::test]
    async fn test_push_and_click_require_active_worker() {
        let (container, _events) = container(Arc::new(MockNetwork::new()));
        assert!(matches!(
            container.push(PushMessage::empty()).await,
            Err(ServiceWorkerError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_fire_sync_consumes_tag() {
        let network = online();
        network.respond("https://gaokao.test/api/quote?category=motivation", 200, "{}");
        let (container, _events) = container(network);
        container.register(config("v1")).await.unwrap();

        container.register_sync("background-quote-sync").await;
        let outcome = container.fire_sync("background-quote-sync").await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Refreshed { .. }));
        assert!(container.scope().sync.read().await.tags().is_empty());
    }
}
