//! # Countdown Offline Worker
//!
//! The offline cache proxy of the countdown application: a background worker
//! that intercepts requests from controlled pages, serves cached responses
//! when the network fails, refreshes data in the background and shows push
//! notifications.
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host side)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (generation records)
//!     │
//!     └── OfflineWorker (one per generation)
//!             ├── HandlerTable: EventKind → handler
//!             ├── FetchInterceptor
//!             │       ├── StrategySelector (passthrough / network-first / cache-first)
//!             │       └── CacheStorage ("<prefix>-<generation>" buckets)
//!             └── WorkerScope (clients, notifications, sync tags)
//! ```
//!
//! Every event runs as its own task. Work a handler extends its lifetime
//! with ([`Lifetime::wait_until`]) is tracked, and [`EventTask::settled`]
//! only resolves once all of it has finished.

use countdown_core::CoreError;
use countdown_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod container;
pub mod event;
pub mod fetch;
pub mod lifecycle;
pub mod message;
pub mod push;
pub mod strategy;
pub mod sync;
pub mod worker;

pub use cache::{CacheEntry, CacheHandle, CacheStorage, RequestKey};
pub use clients::{Client, ClientType, Clients};
pub use container::{ContainerEvent, ServiceWorkerContainer};
pub use event::{EventKind, EventOutcome, EventTask, HandlerTable, Lifetime, WorkerEvent};
pub use fetch::FetchInterceptor;
pub use lifecycle::{ServiceWorkerRecord, ServiceWorkerRegistration, ServiceWorkerState};
pub use message::{ClientMessage, MessageEvent, ReplyPort, WorkerReply};
pub use push::{NotificationId, NotificationIntent, Notifications, PushMessage};
pub use strategy::{Policy, RequestClass, StrategySelector};
pub use sync::{SyncManager, SyncOutcome};
pub use worker::{OfflineWorker, WorkerScope};

// ==================== Errors ====================

/// Errors that can occur in offline worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Message error: {0}")]
    Message(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
