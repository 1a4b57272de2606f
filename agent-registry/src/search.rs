//! Request and response shapes for discovery queries.

use std::collections::{BTreeMap, HashSet};

use agent_primitives::{AgentId, UserId};
use serde::{Deserialize, Serialize};

use crate::AgentRegistryEntry;
use crate::store::{SortField, SortOrder};

const DEFAULT_PAGE_SIZE: usize = 20;

/// Filters, ordering and pagination for [`crate::Discovery::search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilter {
    /// Exact category.
    pub category: Option<String>,
    /// Tags that must all be present.
    pub tags: Vec<String>,
    /// Verification badge.
    pub verified: Option<bool>,
    /// Minimum mean rating.
    pub min_rating: Option<f64>,
    /// Exact author.
    pub author: Option<UserId>,
    /// Sort key.
    pub sort: SortField,
    /// Sort direction.
    pub order: SortOrder,
    /// Entries to skip.
    pub offset: usize,
    /// Page size.
    pub limit: usize,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            category: None,
            tags: Vec::new(),
            verified: None,
            min_rating: None,
            author: None,
            sort: SortField::default(),
            order: SortOrder::default(),
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SearchFilter {
    /// Restricts to one category.
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Requires every tag.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets ordering.
    #[must_use]
    pub fn sort_by(mut self, sort: SortField, order: SortOrder) -> Self {
        self.sort = sort;
        self.order = order;
        self
    }

    /// Sets the page window.
    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub(crate) fn accepts(&self, entry: &AgentRegistryEntry) -> bool {
        let metadata = &entry.metadata;
        self.category
            .as_ref()
            .is_none_or(|category| metadata.category() == category)
            && self
                .tags
                .iter()
                .all(|tag| metadata.tags().iter().any(|have| have == tag))
            && self.verified.is_none_or(|verified| entry.verified == verified)
            && self.min_rating.is_none_or(|min| entry.rating >= min)
            && self
                .author
                .as_ref()
                .is_none_or(|author| metadata.author() == author)
    }
}

/// Aggregate counts over a filtered, unpaginated result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facets {
    /// Entries per category.
    pub categories: BTreeMap<String, usize>,
    /// Entries per tag.
    pub tags: BTreeMap<String, usize>,
    /// Entries per author.
    pub authors: BTreeMap<String, usize>,
    /// Entries per whole-star rating bucket.
    pub ratings: BTreeMap<u8, usize>,
}

impl Facets {
    pub(crate) fn add(&mut self, entry: &AgentRegistryEntry) {
        let metadata = &entry.metadata;
        *self
            .categories
            .entry(metadata.category().to_owned())
            .or_default() += 1;
        for tag in metadata.tags() {
            *self.tags.entry(tag.clone()).or_default() += 1;
        }
        *self.authors.entry(metadata.author().to_owned()).or_default() += 1;
        *self.ratings.entry(rating_bucket(entry.rating)).or_default() += 1;
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn rating_bucket(rating: f64) -> u8 {
    rating.floor().clamp(0.0, 5.0) as u8
}

/// One page of search output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    /// Entries on this page.
    pub entries: Vec<AgentRegistryEntry>,
    /// Matches before pagination.
    pub total: usize,
    /// Counts over every match.
    pub facets: Facets,
}

/// An entry with its ranking score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAgent {
    /// Ranked entry.
    pub entry: AgentRegistryEntry,
    /// Heuristic score; larger ranks higher.
    pub score: f64,
}

/// What a user cares about, for [`crate::Discovery::recommendations`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationContext {
    /// User asking.
    pub user_id: UserId,
    /// Categories the user prefers.
    pub preferred_categories: Vec<String>,
    /// Tags the user prefers.
    pub preferred_tags: Vec<String>,
    /// Agents the user already has; never recommended.
    pub owned_agents: HashSet<AgentId>,
}

/// A label and how many agents carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyCount {
    /// Category or tag.
    pub name: String,
    /// Agents carrying it.
    pub count: usize,
}
