//! Clients API: the pages a worker can control, focus and open.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::{Result, ServiceWorkerError};

/// A client (page session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Generation of the worker controlling this client, if any.
    pub controller: Option<String>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

impl Client {
    /// A window client not yet controlled by any worker.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Match all clients of a type.
    pub fn match_all(&self, client_type: ClientType) -> Vec<&Client> {
        let mut matched: Vec<_> = self
            .clients
            .values()
            .filter(|c| client_type == ClientType::All || c.client_type == client_type)
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Number of clients controlled by `generation`.
    pub fn controlled_by(&self, generation: &str) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller.as_deref() == Some(generation))
            .count()
    }

    /// Make `generation` the controller of every client. Returns how many changed.
    pub fn claim(&mut self, generation: &str) -> usize {
        let mut changed = 0;
        for client in self.clients.values_mut() {
            if client.controller.as_deref() != Some(generation) {
                client.controller = Some(generation.to_string());
                changed += 1;
            }
        }
        debug!(generation, changed, "Clients claimed");
        changed
    }

    /// Focus a window client; every other client loses focus.
    pub fn focus(&mut self, id: &str) -> Result<Client> {
        match self.clients.get(id) {
            None => return Err(ServiceWorkerError::NotFound(format!("client {id}"))),
            Some(c) if c.client_type != ClientType::Window => {
                return Err(ServiceWorkerError::State(
                    "Can only focus window clients".to_string(),
                ))
            }
            Some(_) => {}
        }

        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        self.clients
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))
    }

    /// Open a focused window at `url`, controlled by `controller`.
    pub fn open_window(&mut self, url: Url, controller: Option<&str>) -> Client {
        for client in self.clients.values_mut() {
            client.focused = false;
        }
        let mut client = Client::window(url);
        client.focused = true;
        client.controller = controller.map(str::to_string);
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Focus a window already showing `url`, or open one.
    pub fn focus_or_open(&mut self, url: &Url, controller: Option<&str>) -> Result<Client> {
        let existing = self
            .match_all(ClientType::Window)
            .into_iter()
            .find(|c| &c.url == url)
            .map(|c| c.id.clone());

        match existing {
            Some(id) => self.focus(&id),
            None => Ok(self.open_window(url.clone(), controller)),
        }
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:06}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Url {
        Url::parse("https://gaokao.test/").unwrap()
    }

    #[test]
    fn test_open_window_is_focused() {
        let mut clients = Clients::new();
        let first = clients.open_window(root(), None);
        let second = clients.open_window(root().join("/settings").unwrap(), Some("v1"));

        assert!(second.focused);
        assert!(!clients.get(&first.id).unwrap().focused);
        assert_eq!(second.controller.as_deref(), Some("v1"));
        assert_eq!(clients.len(), 2);
    }

    #[test]
    fn test_claim_sets_controller() {
        let mut clients = Clients::new();
        clients.add(Client::window(root()));
        clients.add(Client::window(root()));
        clients.open_window(root(), Some("v2"));

        assert_eq!(clients.controlled_by("v2"), 1);
        assert_eq!(clients.claim("v2"), 2);
        assert_eq!(clients.controlled_by("v2"), 3);
        assert_eq!(clients.claim("v2"), 0);
    }

    #[test]
    fn test_focus_or_open_reuses_window() {
        let mut clients = Clients::new();
        let existing = clients.open_window(root(), None);
        clients.open_window(root().join("/other").unwrap(), None);

        let focused = clients.focus_or_open(&root(), None).unwrap();
        assert_eq!(focused.id, existing.id);
        assert!(focused.focused);
        assert_eq!(clients.len(), 2);
    }

    #[test]
    fn test_focus_rejects_non_window() {
        let mut clients = Clients::new();
        let mut worker = Client::window(root());
        worker.client_type = ClientType::Worker;
        let id = worker.id.clone();
        clients.add(worker);

        assert!(matches!(clients.focus(&id), Err(ServiceWorkerError::State(_))));
        assert!(matches!(clients.focus("missing"), Err(ServiceWorkerError::NotFound(_))));
    }
}
