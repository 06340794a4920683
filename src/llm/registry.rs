//! Caller-owned registry of shared LLM clients keyed by configuration name.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::LlmClient;

/// One shared client per logical configuration name.
///
/// Whoever assembles agents owns the registry and hands clients to each agent
/// explicitly; there is no process-wide instance.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<dyn LlmClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.read().await.get(name).cloned()
    }

    /// Register a client, returning the one it replaced.
    pub async fn insert(
        &self,
        name: impl Into<String>,
        client: Arc<dyn LlmClient>,
    ) -> Option<Arc<dyn LlmClient>> {
        self.clients.write().await.insert(name.into(), client)
    }

    /// Return the client registered under `name`, building it on first use.
    pub async fn get_or_insert_with<F>(&self, name: &str, build: F) -> Arc<dyn LlmClient>
    where
        F: FnOnce() -> Arc<dyn LlmClient>,
    {
        if let Some(client) = self.get(name).await {
            return client;
        }
        let mut clients = self.clients.write().await;
        clients
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating LLM client for config '{}'", name);
                build()
            })
            .clone()
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.write().await.remove(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
