//! Worker events, the handler table and lifetime extension.
//!
//! A host dispatches a [`WorkerEvent`] through a [`HandlerTable`] and gets an
//! [`EventTask`] back. The event is handled only once the task has settled:
//! the handler itself has returned *and* every piece of work it registered
//! through [`Lifetime::wait_until`] has finished.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use countdown_net::{Request, Response};
use futures::future::BoxFuture;
use futures::FutureExt;
use hashbrown::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::message::MessageEvent;
use crate::push::{NotificationId, PushMessage};
use crate::sync::SyncOutcome;
use crate::{Result, ServiceWorkerError};

// ==================== Events ====================

/// Kind of event, the key of the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Sync,
    Push,
    NotificationClick,
    Message,
}

/// An event delivered to a worker.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Pre-populate the cache for a new generation.
    Install,
    /// Evict stale generations and claim clients.
    Activate,
    /// An intercepted request.
    Fetch(Request),
    /// A background sync tag fired.
    Sync { tag: String },
    /// An inbound push message.
    Push(PushMessage),
    /// The user clicked a notification or one of its actions.
    NotificationClick {
        id: NotificationId,
        action: Option<String>,
    },
    /// A command posted by a page.
    Message(MessageEvent),
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Sync { .. } => EventKind::Sync,
            WorkerEvent::Push(_) => EventKind::Push,
            WorkerEvent::NotificationClick { .. } => EventKind::NotificationClick,
            WorkerEvent::Message(_) => EventKind::Message,
        }
    }
}

/// What a handler produced.
#[derive(Debug)]
pub enum EventOutcome {
    /// Install stored this many manifest entries.
    Installed { cached: usize },
    /// Activation deleted these buckets and claimed this many clients.
    Activated { deleted: Vec<String>, claimed: usize },
    /// Respond to the intercepted request with this response.
    Response(Response),
    /// Let the request go to the network untouched.
    Passthrough,
    /// Background sync ran.
    Synced(SyncOutcome),
    /// A notification is on screen.
    NotificationShown(NotificationId),
    /// A notification click was handled; carries the client opened or focused.
    NotificationClicked { client: Option<String> },
    /// A page message was handled.
    MessageHandled,
    /// No handler, or the handler ignored the event.
    Unhandled,
}

// ==================== Lifetime ====================

/// Work that keeps an event alive after its handler returned.
#[derive(Clone, Default)]
pub struct Lifetime {
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` in the background; the event is not settled until it ends.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Number of tracked tasks that haven't finished yet.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every tracked task, including ones added while waiting.
    pub async fn settled(&self) {
        loop {
            let batch: Vec<_> = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
                .collect();
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                if let Err(e) = handle.await {
                    error!(error = %e, "Extended work did not complete");
                }
            }
        }
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("pending", &self.pending())
            .finish()
    }
}

// ==================== Handler Table ====================

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<EventOutcome>>;

/// A registered event handler.
pub type Handler = Arc<dyn Fn(WorkerEvent, Lifetime) -> HandlerFuture + Send + Sync>;

/// Handlers keyed by event kind.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<EventKind, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn on<F, Fut>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(WorkerEvent, Lifetime) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<EventOutcome>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |event: WorkerEvent, lifetime: Lifetime| -> HandlerFuture {
                handler(event, lifetime).boxed()
            });
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: EventKind) -> Option<&Handler> {
        self.handlers.get(&kind)
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Run the handler for `event` as its own task.
    pub fn dispatch(&self, event: WorkerEvent) -> EventTask {
        let kind = event.kind();
        let lifetime = Lifetime::new();

        let handle = match self.handlers.get(&kind) {
            Some(handler) => {
                debug!(?kind, "Dispatching event");
                tokio::spawn(handler(event, lifetime.clone()))
            }
            None => {
                debug!(?kind, "No handler registered");
                tokio::spawn(async { Ok(EventOutcome::Unhandled) })
            }
        };

        EventTask {
            kind,
            handle,
            lifetime,
        }
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ==================== Event Task ====================

/// A dispatched event. The host must await it before treating the event as handled.
#[must_use = "an event is not handled until its task settles"]
#[derive(Debug)]
pub struct EventTask {
    kind: EventKind,
    handle: JoinHandle<Result<EventOutcome>>,
    lifetime: Lifetime,
}

impl EventTask {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The handler's result as soon as it returns. Background work may still
    /// be running on the returned lifetime, which the host must settle.
    pub async fn outcome(self) -> (Result<EventOutcome>, Lifetime) {
        let result = match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ServiceWorkerError::State(format!(
                "{:?} handler did not complete: {e}",
                self.kind
            ))),
        };
        (result, self.lifetime)
    }

    /// The handler's result once all extended work has finished.
    pub async fn settled(self) -> Result<EventOutcome> {
        let (result, lifetime) = self.outcome().await;
        lifetime.settled().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unregistered_kind_is_unhandled() {
        let table = HandlerTable::new();
        let outcome = table.dispatch(WorkerEvent::Install).settled().await.unwrap();
        assert!(matches!(outcome, EventOutcome::Unhandled));
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let mut table = HandlerTable::new();
        table.on(EventKind::Install, |_, _| async { Ok(EventOutcome::Installed { cached: 3 }) });
        table.on(EventKind::Activate, |_, _| async {
            Ok(EventOutcome::Activated {
                deleted: vec![],
                claimed: 0,
            })
        });

        assert!(table.contains(EventKind::Install));
        assert!(!table.contains(EventKind::Push));

        let outcome = table.dispatch(WorkerEvent::Install).settled().await.unwrap();
        assert!(matches!(outcome, EventOutcome::Installed { cached: 3 }));
    }

    #[tokio::test]
    async fn test_settled_waits_for_extended_work() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut table = HandlerTable::new();
        let counter = done.clone();
        table.on(EventKind::Activate, move |_, lifetime| {
            let counter = counter.clone();
            async move {
                let nested = lifetime.clone();
                lifetime.wait_until(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    let counter = counter.clone();
                    // work registered while the host is already waiting
                    nested.wait_until(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                });
                Ok(EventOutcome::MessageHandled)
            }
        });

        table.dispatch(WorkerEvent::Activate).settled().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_outcome_returns_before_extended_work() {
        let mut table = HandlerTable::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(rx)));
        table.on(EventKind::Install, move |_, lifetime| {
            let gate = gate.lock().unwrap().take();
            async move {
                if let Some(rx) = gate {
                    lifetime.wait_until(async move {
                        let _ = rx.await;
                    });
                }
                Ok(EventOutcome::Installed { cached: 0 })
            }
        });

        let (result, lifetime) = table.dispatch(WorkerEvent::Install).outcome().await;
        assert!(result.is_ok());
        assert_eq!(lifetime.pending(), 1);

        tx.send(()).unwrap();
        lifetime.settled().await;
        assert_eq!(lifetime.pending(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_returned() {
        let mut table = HandlerTable::new();
        table.on(EventKind::Install, |_, _| async {
            Err(ServiceWorkerError::InstallFailed("manifest".into()))
        });

        let result = table.dispatch(WorkerEvent::Install).settled().await;
        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
    }
}
