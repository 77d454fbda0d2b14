//! Provider Directory
//!
//! The collaborator boundary between the orchestration engine and the
//! providers it drives. Defines what a provider is, how it advertises itself,
//! and how the engine finds one for a step.
//!
//! # Key Concepts
//!
//! - **Provider**: anything that can `execute(operation, parameters)`
//! - **ProviderHandle**: id, kind, capabilities and metadata plus the provider itself
//! - **CapabilityDirectory**: best-match lookup and a change subscription channel
//! - **DirectoryEvent**: discovered / updated / removed notifications

pub mod directory;
pub mod error;
pub mod events;
pub mod handle;
pub mod provider;

pub use directory::{CapabilityDirectory, InMemoryDirectory};
pub use error::{DirectoryError, ProviderError, Result};
pub use events::DirectoryEvent;
pub use handle::{ProviderHandle, ProviderId, ProviderMetadata};
pub use provider::{FnProvider, Parameters, Provider, ProviderKind};
