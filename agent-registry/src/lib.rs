//! Agent catalog and discovery for the agent exchange.
//!
//! [`AgentRegistry`] validates and stores published agents through the
//! [`AgentStore`] collaborator. [`Discovery`] builds search indexes from
//! catalog snapshots and ranks agents for search, similarity, recommendation
//! and trending queries.

#![warn(missing_docs, clippy::pedantic)]

mod discovery;
mod entry;
mod error;
mod events;
mod registry;
mod search;
mod store;
mod validation;

pub use discovery::Discovery;
pub use entry::{AgentRegistryEntry, Review, compute_checksum, mean_rating};
pub use error::{RegistryError, RegistryResult};
pub use events::RegistryEvent;
pub use registry::{AgentRegistry, PublishRequest, UpdateRequest};
pub use search::{
    Facets, FrequencyCount, RecommendationContext, ScoredAgent, SearchFilter, SearchResults,
};
pub use store::{
    AgentStore, AgentUpdate, InMemoryAgentStore, SortField, SortOrder, StorePage, StoreQuery,
};
pub use validation::{MAX_CODE_BYTES, find_blocked_pattern, validate_code, validate_metadata};
