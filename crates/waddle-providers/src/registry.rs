//! Reloadable provider registry.
//!
//! Selection must stay lock-free on the read path, so the registry is an
//! immutable snapshot behind an `RwLock<Arc<_>>`: readers clone the Arc
//! at request start and keep using it even if a reload publishes a new
//! snapshot mid-request. Old handles drain naturally: the last request
//! holding the old Arc drops it, which drops the handles.

use std::sync::{Arc, Mutex, RwLock};

use rusqlite::Connection;
use tracing::info;

use crate::anthropic::AnthropicHandle;
use crate::db::{list_enabled_links, ProviderLink};
use crate::ollama::OllamaHandle;
use crate::openai::OpenAiHandle;
use crate::provider::ProviderHandle;
use waddle_core::types::ProviderKind;

/// One enabled link plus its typed handle.
pub struct RegisteredProvider {
    pub link: ProviderLink,
    pub handle: Box<dyn ProviderHandle>,
}

/// Immutable view of every enabled provider, in link-id order.
#[derive(Default)]
pub struct RegistrySnapshot {
    pub providers: Vec<Arc<RegisteredProvider>>,
}

impl RegistrySnapshot {
    /// Links eligible to serve `model`: those advertising it, plus those
    /// advertising nothing at all ("accepts any").
    pub fn candidates_for(&self, model: &str) -> Vec<Arc<RegisteredProvider>> {
        self.providers
            .iter()
            .filter(|p| {
                p.link.model_list.is_empty() || p.link.model_list.iter().any(|m| m == model)
            })
            .cloned()
            .collect()
    }

    pub fn by_id(&self, link_id: &str) -> Option<Arc<RegisteredProvider>> {
        self.providers.iter().find(|p| p.link.id == link_id).cloned()
    }
}

pub struct ProviderRegistry {
    db: Arc<Mutex<Connection>>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl ProviderRegistry {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self {
            db,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Rebuild the snapshot from the provider_links table and publish it
    /// with a single pointer swap. Returns the number of live handles.
    pub fn reload(&self) -> rusqlite::Result<usize> {
        let links = {
            let conn = self.db.lock().unwrap();
            list_enabled_links(&conn)?
        };
        let providers: Vec<Arc<RegisteredProvider>> = links
            .into_iter()
            .map(|link| {
                let handle = build_handle(&link);
                Arc::new(RegisteredProvider { link, handle })
            })
            .collect();
        let count = providers.len();
        self.publish(providers);
        info!(providers = count, "provider registry reloaded");
        Ok(count)
    }

    /// Swap in a prebuilt provider set. Also the seam tests use to
    /// install scripted handles.
    pub fn publish(&self, providers: Vec<Arc<RegisteredProvider>>) {
        let snapshot = Arc::new(RegistrySnapshot { providers });
        *self.snapshot.write().unwrap() = snapshot;
    }

    /// Current snapshot. Requests take one of these at the start and use
    /// it throughout, so a concurrent reload never changes a request's
    /// candidate set midway.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().unwrap().clone()
    }
}

fn build_handle(link: &ProviderLink) -> Box<dyn ProviderHandle> {
    match link.kind {
        ProviderKind::OpenAi => Box::new(OpenAiHandle::new(link)),
        ProviderKind::Anthropic => Box::new(AnthropicHandle::new(link)),
        ProviderKind::Ollama => Box::new(OllamaHandle::new(link)),
    }
}
