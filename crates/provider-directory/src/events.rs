//! Directory change notifications

use serde::{Deserialize, Serialize};

use crate::handle::{ProviderId, ProviderMetadata};

/// Events published on the directory's subscription channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DirectoryEvent {
    /// A provider became available
    #[serde(rename_all = "camelCase")]
    ProviderDiscovered {
        provider_id: ProviderId,
    },

    /// A provider's advertised metadata changed
    #[serde(rename_all = "camelCase")]
    ProviderUpdated {
        provider_id: ProviderId,
        metadata: ProviderMetadata,
    },

    /// A provider left the directory
    #[serde(rename_all = "camelCase")]
    ProviderRemoved {
        provider_id: ProviderId,
    },
}

impl DirectoryEvent {
    pub fn provider_id(&self) -> &str {
        match self {
            Self::ProviderDiscovered { provider_id }
            | Self::ProviderUpdated { provider_id, .. }
            | Self::ProviderRemoved { provider_id } => provider_id,
        }
    }
}
