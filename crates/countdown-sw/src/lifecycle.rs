//! Generation lifecycle: registration slots, precache and stale-bucket eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use countdown_net::{Fetch, Request};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a worker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed or replaced by a newer generation.
    Redundant,
}

/// One worker generation as seen by the registration.
#[derive(Debug, Clone)]
pub struct ServiceWorkerRecord {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Cache generation this worker owns.
    pub generation: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Whether skip-waiting was signalled.
    pub skip_waiting: bool,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorkerRecord {
    pub fn new(generation: &str) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            generation: generation.to_string(),
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(generation = %self.generation, from = ?self.state, to = ?state, "Worker state changed");
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// The installing, waiting and active slots for one scope.
#[derive(Debug, Clone)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorkerRecord>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorkerRecord>,

    /// Active worker.
    pub active: Option<ServiceWorkerRecord>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Generation of the active worker.
    pub fn active_generation(&self) -> Option<&str> {
        self.active.as_ref().map(|w| w.generation.as_str())
    }

    /// Put a new generation in the installing slot. An install already in
    /// progress becomes redundant.
    pub fn begin_install(&mut self, generation: &str) -> ServiceWorkerId {
        if let Some(mut replaced) = self.installing.take() {
            replaced.set_state(ServiceWorkerState::Redundant);
        }
        let mut worker = ServiceWorkerRecord::new(generation);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        self.installing = Some(worker);
        id
    }

    /// Transition the install `id` to waiting, replacing any older waiting
    /// worker. Returns false if a newer registration took the installing slot
    /// in the meantime.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> bool {
        let Some(mut worker) = self.take_installing(id) else {
            return false;
        };
        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut replaced) = self.waiting.replace(worker) {
            replaced.set_state(ServiceWorkerState::Redundant);
        }
        true
    }

    /// Discard the install `id`. The active worker is untouched. Returns
    /// `None` if that install was already superseded.
    pub fn install_failed(&mut self, id: ServiceWorkerId, error: &str) -> Option<ServiceWorkerRecord> {
        let mut worker = self.take_installing(id)?;
        worker.error = Some(error.to_string());
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    fn take_installing(&mut self, id: ServiceWorkerId) -> Option<ServiceWorkerRecord> {
        match &self.installing {
            Some(worker) if worker.id == id => self.installing.take(),
            _ => None,
        }
    }

    /// Whether `generation` still owns a slot: installing, waiting or active.
    pub fn holds(&self, generation: &str) -> bool {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .any(|w| w.generation == generation)
    }

    /// Whether `generation` is the active or waiting worker.
    pub fn is_current(&self, generation: &str) -> bool {
        [&self.waiting, &self.active]
            .into_iter()
            .flatten()
            .any(|w| w.generation == generation)
    }

    /// Flag the newest pending worker to activate without waiting.
    pub fn skip_waiting(&mut self) -> bool {
        match self.installing.as_mut().or(self.waiting.as_mut()) {
            Some(worker) => {
                worker.skip_waiting = true;
                true
            }
            None => false,
        }
    }

    /// Whether the waiting worker may activate, given how many clients the
    /// active worker still controls.
    pub fn can_activate(&self, controlled_by_active: usize) -> bool {
        if self
            .active
            .as_ref()
            .is_some_and(|w| w.state == ServiceWorkerState::Activating)
        {
            return false;
        }
        match &self.waiting {
            Some(worker) => worker.skip_waiting || self.active.is_none() || controlled_by_active == 0,
            None => false,
        }
    }

    /// Move the waiting worker into the active slot in `Activating` state.
    /// Returns its id and the previous active worker, now redundant.
    pub fn begin_activation(&mut self) -> Result<(ServiceWorkerId, Option<ServiceWorkerRecord>)> {
        let mut worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::State("no waiting worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Activating);
        let id = worker.id;

        let previous = self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        Ok((id, previous))
    }

    /// Finish activation of the worker `id`.
    pub fn activation_complete(&mut self, id: ServiceWorkerId) -> Result<()> {
        match self.active.as_mut() {
            Some(worker) if worker.id == id && worker.state == ServiceWorkerState::Activating => {
                worker.set_state(ServiceWorkerState::Activated);
                Ok(())
            }
            Some(worker) => Err(ServiceWorkerError::State(format!(
                "active worker {} is {:?}, not the one activating",
                worker.generation, worker.state
            ))),
            None => Err(ServiceWorkerError::State("no active worker".to_string())),
        }
    }

    /// Reinstate a generation that was active in an earlier run.
    pub fn restore(&mut self, generation: &str) {
        let mut worker = ServiceWorkerRecord::new(generation);
        worker.set_state(ServiceWorkerState::Activated);
        self.active = Some(worker);
    }
}

// ==================== Install / Activate steps ====================

/// Fetch every URL and store the responses in `bucket`.
///
/// Nothing is written unless every fetch succeeds with a 2xx status.
pub async fn precache(
    network: &dyn Fetch,
    caches: &CacheStorage,
    bucket: &str,
    urls: &[Url],
) -> Result<usize> {
    let fetches = urls.iter().map(|url| async move {
        let request = Request::get(url.clone());
        let response = network.fetch(&request).await.map_err(|e| {
            ServiceWorkerError::InstallFailed(format!("{url}: {e}"))
        })?;
        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed(format!(
                "{url}: status {}",
                response.status
            )));
        }
        Ok((RequestKey::for_request(&request), response))
    });
    let responses = try_join_all(fetches).await?;

    let cache = caches.open(bucket).await?;
    for (key, response) in &responses {
        cache
            .put(key.clone(), response)
            .await
            .map_err(|e| ServiceWorkerError::InstallFailed(format!("{key}: {e}")))?;
    }

    info!(bucket, entries = responses.len(), "Precache complete");
    Ok(responses.len())
}

/// Delete every bucket not named in `keep`. Failures are logged and skipped.
pub async fn purge_stale(caches: &CacheStorage, keep: &[String]) -> Vec<String> {
    let mut deleted = Vec::new();
    for name in caches.keys().await {
        if keep.contains(&name) {
            continue;
        }
        match caches.delete(&name).await {
            Ok(_) => {
                info!(bucket = %name, "Deleted stale bucket");
                deleted.push(name);
            }
            Err(e) => warn!(bucket = %name, error = %e, "Could not delete stale bucket"),
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use countdown_net::mock::MockNetwork;
    use countdown_net::Response;

    fn scope() -> Url {
        Url::parse("https://gaokao.test/").unwrap()
    }

    fn urls(paths: &[&str]) -> Vec<Url> {
        paths.iter().map(|p| scope().join(p).unwrap()).collect()
    }

    #[test]
    fn test_install_then_activate() {
        let mut reg = ServiceWorkerRegistration::new(scope());
        let id = reg.begin_install("v1");
        assert_eq!(reg.installing.as_ref().unwrap().state, ServiceWorkerState::Installing);

        assert!(reg.install_complete(id));
        assert!(reg.installing.is_none());
        assert_eq!(reg.waiting.as_ref().unwrap().state, ServiceWorkerState::Installed);
        // nothing active yet, so the waiting worker may activate
        assert!(reg.can_activate(0));

        let (activating, previous) = reg.begin_activation().unwrap();
        assert_eq!(activating, id);
        assert!(previous.is_none());
        assert_eq!(reg.active.as_ref().unwrap().state, ServiceWorkerState::Activating);
        reg.activation_complete(id).unwrap();
        assert!(reg.active.as_ref().unwrap().is_active());
        assert_eq!(reg.active_generation(), Some("v1"));
    }

    #[test]
    fn test_waiting_blocked_by_controlled_clients() {
        let mut reg = ServiceWorkerRegistration::new(scope());
        reg.restore("v1");
        let id = reg.begin_install("v2");
        assert!(reg.install_complete(id));

        assert!(!reg.can_activate(2));
        assert!(reg.can_activate(0));

        assert!(reg.skip_waiting());
        assert!(reg.can_activate(2));
    }

    #[test]
    fn test_activation_makes_previous_redundant() {
        let mut reg = ServiceWorkerRegistration::new(scope());
        reg.restore("v1");
        let id = reg.begin_install("v2");
        reg.install_complete(id);

        let (_, previous) = reg.begin_activation().unwrap();
        let previous = previous.unwrap();
        assert_eq!(previous.generation, "v1");
        assert!(previous.is_redundant());
        reg.activation_complete(id).unwrap();
        assert_eq!(reg.active_generation(), Some("v2"));
    }

    #[test]
    fn test_install_failure_keeps_active() {
        let mut reg = ServiceWorkerRegistration::new(scope());
        reg.restore("v1");
        let id = reg.begin_install("v2");

        let failed = reg.install_failed(id, "offline").unwrap();
        assert!(failed.is_redundant());
        assert_eq!(failed.error.as_deref(), Some("offline"));
        assert!(reg.waiting.is_none());
        assert_eq!(reg.active_generation(), Some("v1"));
        assert!(!reg.install_complete(id));
    }

    #[test]
    fn test_superseded_install_cannot_complete() {
        let mut reg = ServiceWorkerRegistration::new(scope());
        reg.restore("v1");
        let older = reg.begin_install("v2");
        let newer = reg.begin_install("v3");

        // the older install finishing must not promote the newer record
        assert!(!reg.install_complete(older));
        assert!(reg.install_failed(older, "late").is_none());
        assert_eq!(reg.installing.as_ref().unwrap().generation, "v3");
        assert!(reg.waiting.is_none());

        assert!(reg.install_complete(newer));
        assert_eq!(reg.waiting.as_ref().unwrap().generation, "v3");
        assert!(reg.holds("v3"));
        assert!(!reg.holds("v2"));
    }

    #[test]
    fn test_no_second_activation_while_activating() {
        let mut reg = ServiceWorkerRegistration::new(scope());
        let first = reg.begin_install("v1");
        reg.install_complete(first);
        reg.begin_activation().unwrap();

        let second = reg.begin_install("v2");
        reg.install_complete(second);
        reg.skip_waiting();
        assert!(!reg.can_activate(0));
        assert!(reg.activation_complete(second).is_err());

        reg.activation_complete(first).unwrap();
        assert!(reg.can_activate(0));
    }

    #[test]
    fn test_current_means_waiting_or_active() {
        let mut reg = ServiceWorkerRegistration::new(scope());
        reg.restore("v1");
        let id = reg.begin_install("v2");
        assert!(reg.is_current("v1"));
        assert!(!reg.is_current("v2"));
        assert!(reg.holds("v2"));

        reg.install_complete(id);
        reg.begin_activation().unwrap();
        assert!(reg.is_current("v2"));
        assert!(!reg.is_current("v1"));
    }

    #[tokio::test]
    async fn test_precache_stores_every_url() {
        let network = MockNetwork::new()
            .with_response("https://gaokao.test/", 200, "<html></html>")
            .with_response("https://gaokao.test/favicon.ico", 200, vec![0u8, 1]);
        let caches = CacheStorage::in_memory();

        let stored = precache(&network, &caches, "b-v1", &urls(&["/", "/favicon.ico"]))
            .await
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(caches.handle("b-v1").len().await, 2);
    }

    #[tokio::test]
    async fn test_precache_is_all_or_nothing() {
        let network = MockNetwork::new().with_response("https://gaokao.test/", 200, "<html></html>");
        let caches = CacheStorage::in_memory();

        // /manifest.json is unrouted and answers 404
        let result = precache(&network, &caches, "b-v1", &urls(&["/", "/manifest.json"])).await;
        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert!(!caches.has("b-v1").await);

        network.set_offline(true);
        let result = precache(&network, &caches, "b-v1", &urls(&["/"])).await;
        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert!(caches.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_purge_keeps_only_current() {
        let caches = CacheStorage::in_memory();
        let key = RequestKey::get(&scope());
        for name in ["gaokao-countdown-v1", "gaokao-countdown-v2", "unrelated"] {
            let response = Response::with_content_type(scope(), "text/html", "x");
            caches.open(name).await.unwrap().put(key.clone(), &response).await.unwrap();
        }

        let deleted = purge_stale(&caches, &["gaokao-countdown-v2".to_string()]).await;
        assert_eq!(deleted, vec!["gaokao-countdown-v1".to_string(), "unrelated".to_string()]);
        assert_eq!(caches.keys().await, vec!["gaokao-countdown-v2".to_string()]);
    }
}
