//! Capability directory trait and in-memory implementation
//!
//! The directory owns provider discovery. The engine only queries it and
//! listens to its event channel.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::{DirectoryError, Result};
use crate::events::DirectoryEvent;
use crate::handle::{ProviderHandle, ProviderId, ProviderMetadata};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lookup interface the engine queries during allocation
pub trait CapabilityDirectory: Send + Sync {
    /// Best provider offering `operation` and every listed capability
    fn find_best_provider(
        &self,
        operation: &str,
        capabilities: &[String],
    ) -> Option<ProviderHandle>;

    /// All providers offering `capability`, best first
    fn find_providers_by_capability(&self, capability: &str) -> Vec<ProviderHandle>;

    /// Subscribe to discovery, update and removal events
    fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent>;
}

/// Directory backed by a map, with change notifications over broadcast
pub struct InMemoryDirectory {
    providers: RwLock<HashMap<ProviderId, ProviderHandle>>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            providers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Add a provider and announce it
    pub fn register(&self, handle: ProviderHandle) -> Result<()> {
        let provider_id = handle.id.clone();
        {
            let mut providers = self.providers.write();
            if providers.contains_key(&provider_id) {
                return Err(DirectoryError::DuplicateProvider(provider_id));
            }
            providers.insert(provider_id.clone(), handle);
        }
        log::debug!("Provider '{}' registered", provider_id);
        self.publish(DirectoryEvent::ProviderDiscovered { provider_id });
        Ok(())
    }

    /// Replace a provider's metadata and announce the change
    pub fn update_metadata(&self, provider_id: &str, metadata: ProviderMetadata) -> Result<()> {
        {
            let mut providers = self.providers.write();
            let handle = providers
                .get_mut(provider_id)
                .ok_or_else(|| DirectoryError::UnknownProvider(provider_id.to_string()))?;
            handle.metadata = metadata.clone();
        }
        log::debug!(
            "Provider '{}' updated (health {:.2})",
            provider_id,
            metadata.health_score
        );
        self.publish(DirectoryEvent::ProviderUpdated {
            provider_id: provider_id.to_string(),
            metadata,
        });
        Ok(())
    }

    /// Remove a provider and announce it
    pub fn remove(&self, provider_id: &str) -> Result<ProviderHandle> {
        let handle = self
            .providers
            .write()
            .remove(provider_id)
            .ok_or_else(|| DirectoryError::UnknownProvider(provider_id.to_string()))?;
        log::debug!("Provider '{}' removed", provider_id);
        self.publish(DirectoryEvent::ProviderRemoved {
            provider_id: provider_id.to_string(),
        });
        Ok(handle)
    }

    pub fn get(&self, provider_id: &str) -> Option<ProviderHandle> {
        self.providers.read().get(provider_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    fn publish(&self, event: DirectoryEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn ranked<F>(&self, filter: F) -> Vec<ProviderHandle>
    where
        F: Fn(&ProviderHandle) -> bool,
    {
        let mut matches: Vec<ProviderHandle> = self
            .providers
            .read()
            .values()
            .filter(|h| filter(h))
            .cloned()
            .collect();
        matches.sort_by(rank);
        matches
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityDirectory for InMemoryDirectory {
    fn find_best_provider(
        &self,
        operation: &str,
        capabilities: &[String],
    ) -> Option<ProviderHandle> {
        self.ranked(|h| h.has_capability(operation) && h.has_all(capabilities))
            .into_iter()
            .next()
    }

    fn find_providers_by_capability(&self, capability: &str) -> Vec<ProviderHandle> {
        self.ranked(|h| h.has_capability(capability))
    }

    fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }
}

/// Healthiest first, then most reliable, then fastest; id breaks ties
fn rank(a: &ProviderHandle, b: &ProviderHandle) -> Ordering {
    b.metadata
        .health_score
        .total_cmp(&a.metadata.health_score)
        .then_with(|| b.metadata.reliability.total_cmp(&a.metadata.reliability))
        .then_with(|| a.metadata.response_time_ms.cmp(&b.metadata.response_time_ms))
        .then_with(|| a.id.cmp(&b.id))
}
