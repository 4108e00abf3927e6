//! The offline worker of one cache generation and its event handlers.

use std::sync::Arc;

use countdown_core::WorkerConfig;
use countdown_net::{Fetch, Request, Response};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::{CacheHandle, CacheStorage, RequestKey};
use crate::clients::Clients;
use crate::event::{EventKind, EventOutcome, HandlerTable, Lifetime, WorkerEvent};
use crate::fetch::FetchInterceptor;
use crate::lifecycle::{self, ServiceWorkerRegistration};
use crate::message::{ClientMessage, MessageEvent, WorkerReply};
use crate::push::{NotificationId, NotificationIntent, Notifications, PushMessage};
use crate::sync::{self, SyncManager, SyncOutcome};
use crate::{Result, ServiceWorkerError};

/// Shared state every generation's worker sees. Cloning is cheap.
#[derive(Clone)]
pub struct WorkerScope {
    pub caches: CacheStorage,
    pub clients: Arc<RwLock<Clients>>,
    pub notifications: Arc<RwLock<Notifications>>,
    pub sync: Arc<RwLock<SyncManager>>,
    pub registration: Arc<RwLock<ServiceWorkerRegistration>>,
    pub network: Arc<dyn Fetch>,
}

impl WorkerScope {
    pub fn new(caches: CacheStorage, network: Arc<dyn Fetch>, scope: Url) -> Self {
        Self {
            caches,
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(Notifications::new())),
            sync: Arc::new(RwLock::new(SyncManager::new())),
            registration: Arc::new(RwLock::new(ServiceWorkerRegistration::new(scope))),
            network,
        }
    }
}

/// Worker for one generation. Built once from its config, then shared by
/// every handler it registers.
pub struct OfflineWorker {
    config: WorkerConfig,
    bucket: CacheHandle,
    interceptor: FetchInterceptor,
    sync_url: Url,
    root: Url,
    scope: WorkerScope,
}

impl OfflineWorker {
    pub fn new(config: WorkerConfig, scope: WorkerScope) -> Result<Arc<Self>> {
        config.validate()?;
        let interceptor = FetchInterceptor::new(
            &config,
            scope.caches.clone(),
            scope.network.clone(),
            scope.registration.clone(),
        )?;

        Ok(Arc::new(Self {
            bucket: scope.caches.handle(&config.bucket_name()),
            sync_url: config.resolve(&config.sync_endpoint)?,
            root: config.resolve("/")?,
            interceptor,
            config,
            scope,
        }))
    }

    pub fn generation(&self) -> &str {
        &self.config.generation
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The bucket this generation owns.
    pub fn bucket(&self) -> &CacheHandle {
        &self.bucket
    }

    /// Handler table with every event this worker answers.
    pub fn handlers(self: &Arc<Self>) -> HandlerTable {
        let mut table = HandlerTable::new();

        let worker = self.clone();
        table.on(EventKind::Install, move |_, _| {
            let worker = worker.clone();
            async move { worker.install().await }
        });

        let worker = self.clone();
        table.on(EventKind::Activate, move |_, _| {
            let worker = worker.clone();
            async move { worker.activate().await }
        });

        let worker = self.clone();
        table.on(EventKind::Fetch, move |event, lifetime| {
            let worker = worker.clone();
            async move {
                match event {
                    WorkerEvent::Fetch(request) => worker.fetch(request, lifetime).await,
                    other => Err(unexpected(other)),
                }
            }
        });

        let worker = self.clone();
        table.on(EventKind::Sync, move |event, _| {
            let worker = worker.clone();
            async move {
                match event {
                    WorkerEvent::Sync { tag } => Ok(EventOutcome::Synced(worker.sync(&tag).await)),
                    other => Err(unexpected(other)),
                }
            }
        });

        let worker = self.clone();
        table.on(EventKind::Push, move |event, _| {
            let worker = worker.clone();
            async move {
                match event {
                    WorkerEvent::Push(message) => Ok(EventOutcome::NotificationShown(
                        worker.push(&message).await,
                    )),
                    other => Err(unexpected(other)),
                }
            }
        });

        let worker = self.clone();
        table.on(EventKind::NotificationClick, move |event, _| {
            let worker = worker.clone();
            async move {
                match event {
                    WorkerEvent::NotificationClick { id, action } => {
                        worker.notification_click(id, action.as_deref()).await
                    }
                    other => Err(unexpected(other)),
                }
            }
        });

        let worker = self.clone();
        table.on(EventKind::Message, move |event, _| {
            let worker = worker.clone();
            async move {
                match event {
                    WorkerEvent::Message(message) => Ok(worker.message(message).await),
                    other => Err(unexpected(other)),
                }
            }
        });

        table
    }

    // ==================== Lifecycle ====================

    #[instrument(skip(self), fields(generation = %self.config.generation))]
    async fn install(&self) -> Result<EventOutcome> {
        let urls = self.config.precache_urls()?;
        let cached = lifecycle::precache(
            self.scope.network.as_ref(),
            &self.scope.caches,
            self.bucket.name(),
            &urls,
        )
        .await?;

        self.scope.registration.write().await.skip_waiting();
        info!(cached, "Installed");
        Ok(EventOutcome::Installed { cached })
    }

    #[instrument(skip(self), fields(generation = %self.config.generation))]
    async fn activate(&self) -> Result<EventOutcome> {
        // a generation installed behind this one keeps its precached bucket
        let keep: Vec<String> = {
            let registration = self.scope.registration.read().await;
            [&registration.installing, &registration.waiting]
                .into_iter()
                .flatten()
                .map(|w| self.config.bucket_name_for(&w.generation))
                .chain(std::iter::once(self.bucket.name().to_string()))
                .collect()
        };
        let deleted = lifecycle::purge_stale(&self.scope.caches, &keep).await;
        let claimed = self.scope.clients.write().await.claim(&self.config.generation);
        info!(deleted = deleted.len(), claimed, "Activated");
        Ok(EventOutcome::Activated { deleted, claimed })
    }

    // ==================== Fetch ====================

    async fn fetch(&self, request: Request, lifetime: Lifetime) -> Result<EventOutcome> {
        match self.interceptor.handle(&request, &lifetime).await? {
            Some(response) => Ok(EventOutcome::Response(response)),
            None => Ok(EventOutcome::Passthrough),
        }
    }

    // ==================== Sync / Push ====================

    async fn sync(&self, tag: &str) -> SyncOutcome {
        if tag != self.config.sync_tag {
            debug!(tag, "Ignoring unknown sync tag");
            return SyncOutcome::UnknownTag(tag.to_string());
        }
        sync::refresh(self.scope.network.as_ref(), &self.bucket, &self.sync_url).await
    }

    async fn push(&self, message: &PushMessage) -> NotificationId {
        let intent = NotificationIntent::from_push(message, &self.config.notification);
        self.scope.notifications.write().await.show(intent)
    }

    async fn notification_click(&self, id: NotificationId, action: Option<&str>) -> Result<EventOutcome> {
        if self.scope.notifications.write().await.close(id).is_none() {
            debug!(id = id.raw(), "Clicked notification was already closed");
        }

        if action != Some("view") {
            return Ok(EventOutcome::NotificationClicked { client: None });
        }

        let client = self
            .scope
            .clients
            .write()
            .await
            .focus_or_open(&self.root, Some(self.config.generation.as_str()))?;
        debug!(client = %client.id, "Focused window for notification");
        Ok(EventOutcome::NotificationClicked {
            client: Some(client.id),
        })
    }

    // ==================== Messages ====================

    async fn message(&self, mut event: MessageEvent) -> EventOutcome {
        let command = match ClientMessage::parse(&event.data) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Ignoring message");
                return EventOutcome::Unhandled;
            }
        };

        match command {
            ClientMessage::SkipWaiting => {
                self.scope.registration.write().await.skip_waiting();
            }
            ClientMessage::CacheQuote(quote) => self.cache_quote(quote).await,
            ClientMessage::GetCacheSize => {
                let size = self.bucket.len().await;
                reply(&mut event, WorkerReply::CacheSize { size });
            }
            ClientMessage::ClearCache => {
                if let Err(e) = self.scope.caches.delete(self.bucket.name()).await {
                    warn!(bucket = self.bucket.name(), error = %e, "Clearing cache failed");
                }
                reply(&mut event, WorkerReply::CacheCleared);
            }
        }
        EventOutcome::MessageHandled
    }

    async fn cache_quote(&self, quote: Option<Value>) {
        let Some(quote) = quote else {
            warn!("CACHE_QUOTE without a quote");
            return;
        };
        let id = match quote.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                warn!("CACHE_QUOTE quote has no id");
                return;
            }
        };

        let url = match self.config.resolve(&format!("/api/quote/{id}")) {
            Ok(url) => url,
            Err(e) => {
                warn!(id = %id, error = %e, "Quote id does not form a URL");
                return;
            }
        };
        let body = match serde_json::to_vec(&quote) {
            Ok(body) => body,
            Err(e) => {
                warn!(id = %id, error = %e, "Quote could not be serialized");
                return;
            }
        };

        let response = Response::with_content_type(url.clone(), "application/json", body);
        match self.bucket.put(RequestKey::get(&url), &response).await {
            Ok(()) => debug!(id = %id, "Quote cached"),
            Err(e) => warn!(id = %id, error = %e, "Caching quote failed"),
        }
    }
}

fn reply(event: &mut MessageEvent, reply: WorkerReply) {
    match event.take_port() {
        Some(port) => {
            if let Err(e) = port.post_message(reply) {
                warn!(error = %e, "Reply not delivered");
            }
        }
        None => warn!(?reply, "No reply port supplied"),
    }
}

fn unexpected(event: WorkerEvent) -> ServiceWorkerError {
    ServiceWorkerError::State(format!("handler received {:?} event", event.kind()))
}
