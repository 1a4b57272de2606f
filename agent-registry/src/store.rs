//! Storage collaborator for catalog persistence.

use std::cmp::Ordering;
use std::collections::HashMap;

use agent_policy::CodeAnalysis;
use agent_primitives::{AgentId, AgentMetadata};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{AgentRegistryEntry, RegistryError, RegistryResult, Review};

/// Field a listing is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Agent name, case-insensitive.
    Name,
    /// Mean rating.
    Rating,
    /// Install count.
    DownloadCount,
    /// Last update.
    #[default]
    UpdatedAt,
    /// First publish.
    CreatedAt,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Smallest first.
    Asc,
    /// Largest first.
    #[default]
    Desc,
}

/// Orders two entries by `field` in `order`.
pub(crate) fn compare_entries(
    a: &AgentRegistryEntry,
    b: &AgentRegistryEntry,
    field: SortField,
    order: SortOrder,
) -> Ordering {
    let ordering = match field {
        SortField::Name => a
            .metadata
            .name()
            .to_lowercase()
            .cmp(&b.metadata.name().to_lowercase()),
        SortField::Rating => a.rating.total_cmp(&b.rating),
        SortField::DownloadCount => a.download_count.cmp(&b.download_count),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::CreatedAt => a.published_at.cmp(&b.published_at),
    };
    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

/// Filtered listing request understood by every store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreQuery {
    /// Case-insensitive substring over the searchable text.
    pub text: Option<String>,
    /// Exact category.
    pub category: Option<String>,
    /// Tags that must all be present.
    pub tags: Vec<String>,
    /// Verification badge.
    pub verified: Option<bool>,
    /// Minimum mean rating.
    pub min_rating: Option<f64>,
    /// Exact author.
    pub author: Option<String>,
    /// Sort key.
    pub sort: SortField,
    /// Sort direction.
    pub order: SortOrder,
    /// Entries to skip.
    pub offset: usize,
    /// Maximum entries returned; unbounded when `None`.
    pub limit: Option<usize>,
}

impl StoreQuery {
    /// Returns `true` when `entry` passes every filter.
    #[must_use]
    pub fn matches(&self, entry: &AgentRegistryEntry) -> bool {
        let metadata = &entry.metadata;
        if self
            .text
            .as_ref()
            .is_some_and(|text| !entry.searchable_text().contains(&text.to_lowercase()))
        {
            return false;
        }
        if self
            .category
            .as_ref()
            .is_some_and(|category| metadata.category() != category)
        {
            return false;
        }
        if !self
            .tags
            .iter()
            .all(|tag| metadata.tags().iter().any(|have| have == tag))
        {
            return false;
        }
        if self.verified.is_some_and(|verified| entry.verified != verified) {
            return false;
        }
        if self.min_rating.is_some_and(|min| entry.rating < min) {
            return false;
        }
        if self
            .author
            .as_ref()
            .is_some_and(|author| metadata.author() != author)
        {
            return false;
        }
        true
    }
}

/// One page of a store listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorePage {
    /// Entries on this page.
    pub entries: Vec<AgentRegistryEntry>,
    /// Matches before pagination.
    pub total: usize,
}

/// Partial update applied by [`AgentStore::update_agent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUpdate {
    /// Replacement metadata.
    pub metadata: Option<AgentMetadata>,
    /// Replacement code and its checksum.
    pub code: Option<(String, String)>,
    /// Replacement manifest.
    pub manifest: Option<Value>,
    /// New verification badge.
    pub verified: Option<bool>,
    /// Fresh advisory analysis.
    pub analysis: Option<CodeAnalysis>,
}

/// Catalog persistence.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Inserts a new entry.
    async fn save_agent(&self, entry: AgentRegistryEntry) -> RegistryResult<()>;

    /// Fetches an entry.
    async fn get_agent(&self, id: AgentId) -> RegistryResult<Option<AgentRegistryEntry>>;

    /// Runs a filtered, sorted, paginated listing.
    async fn search_agents(&self, query: &StoreQuery) -> RegistryResult<StorePage>;

    /// Applies a partial update and bumps `updated_at`.
    async fn update_agent(&self, id: AgentId, update: AgentUpdate) -> RegistryResult<AgentRegistryEntry>;

    /// Removes an entry, returning it.
    async fn delete_agent(&self, id: AgentId) -> RegistryResult<AgentRegistryEntry>;

    /// Adds one install, returning the new count.
    async fn increment_downloads(&self, id: AgentId) -> RegistryResult<u64>;

    /// Appends a review and recomputes the mean rating.
    async fn add_review(&self, id: AgentId, review: Review) -> RegistryResult<AgentRegistryEntry>;
}

/// Reference store keeping every entry in memory.
#[derive(Debug, Default)]
pub struct InMemoryAgentStore {
    agents: RwLock<HashMap<AgentId, AgentRegistryEntry>>,
}

impl InMemoryAgentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Returns `true` when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn save_agent(&self, entry: AgentRegistryEntry) -> RegistryResult<()> {
        let id = entry.metadata.id();
        let mut agents = self.agents.write().await;
        if agents.contains_key(&id) {
            return Err(RegistryError::AlreadyExists { id });
        }
        agents.insert(id, entry);
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> RegistryResult<Option<AgentRegistryEntry>> {
        Ok(self.agents.read().await.get(&id).cloned())
    }

    async fn search_agents(&self, query: &StoreQuery) -> RegistryResult<StorePage> {
        let agents = self.agents.read().await;
        let mut matched: Vec<_> = agents.values().filter(|entry| query.matches(entry)).collect();
        matched.sort_by(|a, b| compare_entries(a, b, query.sort, query.order));
        let total = matched.len();
        let entries = matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(StorePage { entries, total })
    }

    async fn update_agent(&self, id: AgentId, update: AgentUpdate) -> RegistryResult<AgentRegistryEntry> {
        let mut agents = self.agents.write().await;
        let entry = agents.get_mut(&id).ok_or(RegistryError::AgentNotFound { id })?;
        if let Some(metadata) = update.metadata {
            entry.metadata = metadata;
        }
        if let Some((code, checksum)) = update.code {
            entry.code = code;
            entry.checksum = checksum;
        }
        if let Some(manifest) = update.manifest {
            entry.manifest = manifest;
        }
        if let Some(verified) = update.verified {
            entry.verified = verified;
        }
        if let Some(analysis) = update.analysis {
            entry.analysis = Some(analysis);
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn delete_agent(&self, id: AgentId) -> RegistryResult<AgentRegistryEntry> {
        self.agents
            .write()
            .await
            .remove(&id)
            .ok_or(RegistryError::AgentNotFound { id })
    }

    async fn increment_downloads(&self, id: AgentId) -> RegistryResult<u64> {
        let mut agents = self.agents.write().await;
        let entry = agents.get_mut(&id).ok_or(RegistryError::AgentNotFound { id })?;
        entry.download_count += 1;
        Ok(entry.download_count)
    }

    async fn add_review(&self, id: AgentId, review: Review) -> RegistryResult<AgentRegistryEntry> {
        let mut agents = self.agents.write().await;
        let entry = agents.get_mut(&id).ok_or(RegistryError::AgentNotFound { id })?;
        entry.push_review(review);
        Ok(entry.clone())
    }
}
