//! Search, similarity and ranking over catalog snapshots.
//!
//! Indexes are rebuilt from a full store listing off to the side and then
//! swapped in, so readers always see one complete snapshot.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use agent_primitives::AgentId;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::search::{FrequencyCount, Facets, RecommendationContext, ScoredAgent, SearchFilter, SearchResults};
use crate::store::{AgentStore, StoreQuery, compare_entries};
use crate::{AgentRegistryEntry, RegistryError, RegistryEvent, RegistryResult};

const SECONDS_PER_DAY: f64 = 86_400.0;
const RECOMMENDATION_RECENCY_DAYS: f64 = 30.0;

type Index = HashMap<String, BTreeSet<AgentId>>;

#[derive(Debug, Default)]
struct Snapshot {
    generation: u64,
    entries: Vec<AgentRegistryEntry>,
    searchable: Vec<String>,
    positions: HashMap<AgentId, usize>,
    tokens: Index,
    categories: Index,
    tags: Index,
    capabilities: Index,
}

impl Snapshot {
    fn build(generation: u64, entries: Vec<AgentRegistryEntry>) -> Self {
        let mut snapshot = Self {
            generation,
            ..Self::default()
        };
        for (position, entry) in entries.iter().enumerate() {
            let id = entry.metadata.id();
            let metadata = &entry.metadata;
            let text = entry.searchable_text();
            for token in tokenize(&text) {
                snapshot.tokens.entry(token).or_default().insert(id);
            }
            snapshot
                .categories
                .entry(metadata.category().to_owned())
                .or_default()
                .insert(id);
            for tag in metadata.tags() {
                snapshot.tags.entry(tag.clone()).or_default().insert(id);
            }
            for capability in metadata.capabilities() {
                snapshot
                    .capabilities
                    .entry(capability.name().to_owned())
                    .or_default()
                    .insert(id);
            }
            snapshot.positions.insert(id, position);
            snapshot.searchable.push(text);
        }
        snapshot.entries = entries;
        snapshot
    }

    fn get(&self, id: AgentId) -> Option<&AgentRegistryEntry> {
        self.positions.get(&id).map(|position| &self.entries[*position])
    }
}

/// Lower-cased, punctuation-stripped tokens longer than two characters.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() > 2)
        .map(str::to_lowercase)
}

fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|term| term.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|term| !term.is_empty())
        .collect()
}

/// Discovery over the catalog.
pub struct Discovery {
    store: Arc<dyn AgentStore>,
    snapshot: RwLock<Arc<Snapshot>>,
    generations: AtomicU64,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("indexed", &self.current().entries.len())
            .finish_non_exhaustive()
    }
}

impl Discovery {
    /// Creates a service with an empty snapshot; call [`Self::refresh`].
    #[must_use]
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            generations: AtomicU64::new(0),
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Rebuilds every index from the store and swaps them in, returning how
    /// many agents the live snapshot holds afterwards.
    ///
    /// Each rebuild is numbered before the store is read. A rebuild that
    /// finishes after a later-numbered one is discarded, so overlapping
    /// refreshes never reinstall an older listing.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the previous snapshot stays in place.
    pub async fn refresh(&self) -> RegistryResult<usize> {
        let generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
        let entries = self
            .store
            .search_agents(&StoreQuery::default())
            .await?
            .entries;
        let snapshot = Arc::new(Snapshot::build(generation, entries));

        let mut current = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if current.generation > generation {
            debug!(
                generation,
                live = current.generation,
                "discarding stale discovery rebuild"
            );
            return Ok(current.entries.len());
        }
        let indexed = snapshot.entries.len();
        *current = snapshot;
        debug!(generation, indexed, "discovery indexes rebuilt");
        Ok(indexed)
    }

    /// Refreshes whenever the registry reports a change.
    #[must_use]
    pub fn follow(self: Arc<Self>, mut events: broadcast::Receiver<RegistryEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if let Err(err) = self.refresh().await {
                            warn!(error = %err, "discovery refresh failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Substring search with filters, ordering, pagination and facets.
    ///
    /// Every whitespace-separated query term must occur in an agent's
    /// searchable text. Facets cover all matches, not just the page.
    #[must_use]
    pub fn search(&self, query: &str, filter: &SearchFilter) -> SearchResults {
        let snapshot = self.current();
        let terms = query_terms(query);
        let mut matched: Vec<&AgentRegistryEntry> = snapshot
            .entries
            .iter()
            .zip(&snapshot.searchable)
            .filter(|(_, text)| terms.iter().all(|term| text.contains(term.as_str())))
            .map(|(entry, _)| entry)
            .filter(|entry| filter.accepts(entry))
            .collect();

        let mut facets = Facets::default();
        for entry in &matched {
            facets.add(entry);
        }
        matched.sort_by(|a, b| compare_entries(a, b, filter.sort, filter.order));

        SearchResults {
            total: matched.len(),
            entries: matched
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit)
                .cloned()
                .collect(),
            facets,
        }
    }

    /// Agents resembling `id` by category, tags and capability categories.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AgentNotFound`] when `id` is not indexed.
    pub fn find_similar_agents(&self, id: AgentId, limit: usize) -> RegistryResult<Vec<ScoredAgent>> {
        let snapshot = self.current();
        let target = snapshot.get(id).ok_or(RegistryError::AgentNotFound { id })?;
        let scored = snapshot
            .entries
            .iter()
            .filter(|candidate| candidate.metadata.id() != id)
            .map(|candidate| (candidate, similarity(target, candidate)));
        Ok(rank(scored, limit))
    }

    /// Personalised ranking that skips agents the user already owns.
    #[must_use]
    pub fn recommendations(&self, context: &RecommendationContext, limit: usize) -> Vec<ScoredAgent> {
        let snapshot = self.current();
        let now = Utc::now();
        let scored = snapshot
            .entries
            .iter()
            .filter(|entry| {
                !context.owned_agents.contains(&entry.metadata.id())
                    && entry.metadata.author() != context.user_id
            })
            .map(|entry| (entry, recommendation_score(entry, context, now)));
        rank(scored, limit)
    }

    /// Agents gaining traction within `timeframe`.
    #[must_use]
    pub fn trending_agents(&self, timeframe: Duration, limit: usize) -> Vec<ScoredAgent> {
        let snapshot = self.current();
        let now = Utc::now();
        let scored = snapshot
            .entries
            .iter()
            .map(|entry| (entry, trending_score(entry, timeframe, now)));
        rank(scored, limit)
    }

    /// Categories by agent count, most common first.
    #[must_use]
    pub fn categories(&self) -> Vec<FrequencyCount> {
        frequencies(&self.current().categories)
    }

    /// Tags by agent count, most common first.
    #[must_use]
    pub fn tags(&self) -> Vec<FrequencyCount> {
        frequencies(&self.current().tags)
    }

    /// Agents whose indexed text contains `token` as a whole token.
    #[must_use]
    pub fn agents_with_token(&self, token: &str) -> Vec<AgentId> {
        lookup(&self.current().tokens, &token.to_lowercase())
    }

    /// Agents advertising a capability named `name`.
    #[must_use]
    pub fn agents_with_capability(&self, name: &str) -> Vec<AgentId> {
        lookup(&self.current().capabilities, name)
    }

    /// Number of agents in the current snapshot.
    #[must_use]
    pub fn indexed(&self) -> usize {
        self.current().entries.len()
    }
}

fn lookup(index: &Index, key: &str) -> Vec<AgentId> {
    index
        .get(key)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default()
}

fn frequencies(index: &Index) -> Vec<FrequencyCount> {
    let mut counts: Vec<_> = index
        .iter()
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, ids)| FrequencyCount {
            name: name.clone(),
            count: ids.len(),
        })
        .collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    counts
}

fn rank<'a>(
    scored: impl Iterator<Item = (&'a AgentRegistryEntry, f64)>,
    limit: usize,
) -> Vec<ScoredAgent> {
    let mut ranked: Vec<_> = scored.filter(|(_, score)| *score > 0.0).collect();
    ranked.sort_by(|(a, x), (b, y)| {
        y.total_cmp(x)
            .then_with(|| a.metadata.name().cmp(b.metadata.name()))
    });
    ranked
        .into_iter()
        .take(limit)
        .map(|(entry, score)| ScoredAgent {
            entry: entry.clone(),
            score,
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<_> = a.iter().collect();
    let b: HashSet<_> = b.iter().collect();
    ratio(a.intersection(&b).count(), a.union(&b).count())
}

fn similarity(target: &AgentRegistryEntry, candidate: &AgentRegistryEntry) -> f64 {
    let (target, candidate) = (&target.metadata, &candidate.metadata);
    let same_category = if target.category() == candidate.category() {
        0.3
    } else {
        0.0
    };
    let tags = 0.4 * jaccard(target.tags(), candidate.tags());

    let target_categories: HashSet<_> = target
        .capabilities()
        .iter()
        .map(|capability| capability.category())
        .collect();
    let shared = candidate
        .capabilities()
        .iter()
        .filter(|capability| target_categories.contains(capability.category()))
        .count();
    let capabilities = 0.3 * ratio(shared, candidate.capabilities().len());

    same_category + tags + capabilities
}

#[allow(clippy::cast_precision_loss)]
fn age_seconds(published_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - published_at).num_seconds().max(0) as f64
}

#[allow(clippy::cast_precision_loss)]
fn recommendation_score(
    entry: &AgentRegistryEntry,
    context: &RecommendationContext,
    now: DateTime<Utc>,
) -> f64 {
    let metadata = &entry.metadata;
    let category = if context
        .preferred_categories
        .iter()
        .any(|preferred| preferred == metadata.category())
    {
        0.3
    } else {
        0.0
    };
    let matching_tags = metadata
        .tags()
        .iter()
        .filter(|tag| context.preferred_tags.contains(tag))
        .count();
    let tags = 0.2 * ratio(matching_tags, metadata.tags().len());
    let rating = 0.2 * (entry.rating / 5.0);
    let downloads = 0.1 * (entry.download_count as f64 / 1000.0).min(1.0);
    let verified = if entry.verified { 0.1 } else { 0.0 };
    let age_days = age_seconds(entry.published_at, now) / SECONDS_PER_DAY;
    let recency = 0.1 * (1.0 - age_days / RECOMMENDATION_RECENCY_DAYS).max(0.0);
    category + tags + rating + downloads + verified + recency
}

#[allow(clippy::cast_precision_loss)]
fn trending_score(entry: &AgentRegistryEntry, timeframe: Duration, now: DateTime<Utc>) -> f64 {
    let window = timeframe.as_secs_f64();
    let recency = if window > 0.0 {
        0.6 * (1.0 - age_seconds(entry.published_at, now) / window).max(0.0)
    } else {
        0.0
    };
    let since = chrono::Duration::from_std(timeframe)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let recent_reviews = entry
        .reviews
        .iter()
        .filter(|review| review.created_at >= since)
        .count()
        .min(10);

    entry.rating * 0.3
        + (entry.download_count as f64 / 100.0).min(10.0) * 0.1
        + recency
        + 0.2 * (recent_reviews as f64 / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryAgentStore, Review};
    use agent_primitives::{AgentCapability, AgentMetadata, CapabilityId, ReviewId};
    use serde_json::json;

    fn entry(name: &str, description: &str, category: &str, tags: &[&str], cap_category: &str) -> AgentRegistryEntry {
        let capability = AgentCapability::builder(CapabilityId::new("agent.run").unwrap())
            .name("run")
            .unwrap()
            .description("Runs the agent")
            .category(cap_category)
            .build()
            .unwrap();
        let metadata = AgentMetadata::builder(AgentId::random())
            .name(name)
            .unwrap()
            .version("1.0.0")
            .unwrap()
            .author("alice")
            .unwrap()
            .description(description)
            .category(category)
            .tags(tags.iter().copied())
            .capabilities(vec![capability])
            .build()
            .unwrap();
        let now = Utc::now();
        AgentRegistryEntry {
            metadata,
            code: "return input;".into(),
            manifest: json!({}),
            checksum: crate::compute_checksum("return input;"),
            verified: false,
            published_at: now,
            updated_at: now,
            download_count: 0,
            rating: 0.0,
            reviews: Vec::new(),
            analysis: None,
        }
    }

    async fn discovery(entries: Vec<AgentRegistryEntry>) -> Discovery {
        let store = Arc::new(InMemoryAgentStore::new());
        for entry in entries {
            store.save_agent(entry).await.unwrap();
        }
        let discovery = Discovery::new(store);
        discovery.refresh().await.unwrap();
        discovery
    }

    #[tokio::test]
    async fn search_is_substring_and_with_facets() {
        let discovery = discovery(vec![
            entry("Dental Bot", "Books dental appointments", "support", &["dental", "health"], "chat"),
            entry("Dental Ledger", "Dental billing exports", "finance", &["dental"], "data"),
            entry("Helpdesk", "General customer support", "support", &["support"], "chat"),
        ])
        .await;

        let results = discovery.search("dental", &SearchFilter::default().category("support"));
        assert_eq!(results.total, 1);
        assert_eq!(results.entries[0].metadata.name(), "Dental Bot");
        assert_eq!(results.facets.categories.get("support"), Some(&1));
        assert_eq!(results.facets.categories.get("finance"), None);
        assert_eq!(results.facets.ratings.get(&0), Some(&1));

        let both = discovery.search("DENTAL bill", &SearchFilter::default());
        assert_eq!(both.total, 1);
        assert_eq!(both.entries[0].metadata.name(), "Dental Ledger");

        let paged = discovery.search("", &SearchFilter::default().page(1, 1));
        assert_eq!(paged.total, 3);
        assert_eq!(paged.entries.len(), 1);
        assert_eq!(paged.facets.authors.get("alice"), Some(&3));
    }

    #[tokio::test]
    async fn similar_agents_exclude_self() {
        let target = entry("Dental Bot", "Books dental appointments", "support", &["dental", "health"], "chat");
        let id = target.metadata.id();
        let discovery = discovery(vec![
            target,
            entry("Clinic Bot", "Books clinic appointments", "support", &["health"], "chat"),
            entry("Ledger", "Accounting helper", "finance", &["money"], "data"),
        ])
        .await;

        let similar = discovery.find_similar_agents(id, 10).unwrap();
        assert!(similar.iter().all(|scored| scored.entry.metadata.id() != id));
        assert_eq!(similar.len(), 1);
        let expected = 0.3 + 0.4 * 0.5 + 0.3;
        assert!((similar[0].score - expected).abs() < 1e-9);

        assert!(matches!(
            discovery.find_similar_agents(AgentId::random(), 5),
            Err(RegistryError::AgentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn recommendations_skip_owned_agents() {
        let preferred = entry("Dental Bot", "Books dental appointments", "support", &["dental"], "chat");
        let owned = entry("Owned Bot", "Already installed agent", "support", &["dental"], "chat");
        let owned_id = owned.metadata.id();
        let discovery = discovery(vec![preferred, owned]).await;

        let context = RecommendationContext {
            user_id: "bob".into(),
            preferred_categories: vec!["support".into()],
            preferred_tags: vec!["dental".into()],
            owned_agents: HashSet::from([owned_id]),
        };
        let recommended = discovery.recommendations(&context, 10);
        assert_eq!(recommended.len(), 1);
        assert_eq!(recommended[0].entry.metadata.name(), "Dental Bot");
        // category + tags + fresh publish
        assert!((recommended[0].score - 0.6).abs() < 1e-3);
    }

    #[test]
    fn trending_weights() {
        let mut agent = entry("Trendy", "Fresh and popular", "misc", &[], "misc");
        let now = agent.published_at;
        agent.rating = 4.0;
        agent.download_count = 2_000;
        agent.reviews = (0..12)
            .map(|_| Review {
                id: ReviewId::random(),
                user_id: "u".into(),
                rating: 4,
                comment: String::new(),
                created_at: now,
            })
            .collect();
        let score = trending_score(&agent, Duration::from_secs(7 * 86_400), now);
        assert!((score - (1.2 + 1.0 + 0.6 + 0.2)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn frequency_counts_and_indexes() {
        let discovery = discovery(vec![
            entry("Alpha", "First helper agent", "support", &["a", "b"], "chat"),
            entry("Beta", "Second helper agent", "support", &["b"], "chat"),
            entry("Gamma", "Third helper agent", "finance", &["b"], "data"),
        ])
        .await;
        let categories = discovery.categories();
        assert_eq!(categories[0], FrequencyCount { name: "support".into(), count: 2 });
        assert_eq!(discovery.tags()[0].name, "b");
        assert_eq!(discovery.agents_with_token("helper").len(), 3);
        assert!(discovery.agents_with_token("is").is_empty());
        assert_eq!(discovery.agents_with_capability("run").len(), 3);
        assert_eq!(discovery.indexed(), 3);
    }

    /// Holds the next listing back until a later one has been served.
    #[derive(Default)]
    struct LaggingStore {
        inner: InMemoryAgentStore,
        lag_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl AgentStore for LaggingStore {
        async fn save_agent(&self, entry: AgentRegistryEntry) -> RegistryResult<()> {
            self.inner.save_agent(entry).await
        }

        async fn get_agent(&self, id: AgentId) -> RegistryResult<Option<AgentRegistryEntry>> {
            self.inner.get_agent(id).await
        }

        async fn search_agents(&self, query: &StoreQuery) -> RegistryResult<crate::StorePage> {
            let page = self.inner.search_agents(query).await?;
            if self.lag_next.swap(false, Ordering::AcqRel) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(page)
        }

        async fn update_agent(
            &self,
            id: AgentId,
            update: crate::AgentUpdate,
        ) -> RegistryResult<AgentRegistryEntry> {
            self.inner.update_agent(id, update).await
        }

        async fn delete_agent(&self, id: AgentId) -> RegistryResult<AgentRegistryEntry> {
            self.inner.delete_agent(id).await
        }

        async fn increment_downloads(&self, id: AgentId) -> RegistryResult<u64> {
            self.inner.increment_downloads(id).await
        }

        async fn add_review(&self, id: AgentId, review: Review) -> RegistryResult<AgentRegistryEntry> {
            self.inner.add_review(id, review).await
        }
    }

    #[tokio::test]
    async fn overlapping_refreshes_keep_the_newest_listing() {
        let store = Arc::new(LaggingStore::default());
        store.lag_next.store(true, Ordering::Release);
        let discovery = Arc::new(Discovery::new(Arc::clone(&store) as Arc<dyn AgentStore>));

        let stale = {
            let discovery = Arc::clone(&discovery);
            tokio::spawn(async move { discovery.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        store
            .save_agent(entry("Late Agent", "Published during a rebuild", "support", &[], "chat"))
            .await
            .unwrap();
        assert_eq!(discovery.refresh().await.unwrap(), 1);

        assert_eq!(stale.await.unwrap().unwrap(), 1);
        assert_eq!(discovery.indexed(), 1);
        assert_eq!(discovery.search("late", &SearchFilter::default()).total, 1);
    }
}
