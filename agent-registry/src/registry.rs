//! Catalog operations: publish, update, install, review and verify.

use std::sync::Arc;

use agent_policy::{CodeAnalyzer, Permission, SecurityManager};
use agent_primitives::{AgentId, AgentMetadata, ReviewId};
use agent_sandbox::ScriptEngine;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::store::{AgentStore, AgentUpdate, SortField, SortOrder, StorePage, StoreQuery};
use crate::validation::{validate_code, validate_metadata};
use crate::{AgentRegistryEntry, RegistryError, RegistryEvent, RegistryResult, Review, compute_checksum};

const EVENT_CAPACITY: usize = 256;

/// Input to [`AgentRegistry::publish_agent`].
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Agent metadata; its author must be the publishing user.
    pub metadata: AgentMetadata,
    /// Agent source text.
    pub code: String,
    /// Free-form manifest.
    pub manifest: Value,
}

impl PublishRequest {
    /// Creates a request with an empty manifest.
    #[must_use]
    pub fn new(metadata: AgentMetadata, code: impl Into<String>) -> Self {
        Self {
            metadata,
            code: code.into(),
            manifest: json!({}),
        }
    }

    /// Attaches a manifest.
    #[must_use]
    pub fn with_manifest(mut self, manifest: Value) -> Self {
        self.manifest = manifest;
        self
    }
}

/// Input to [`AgentRegistry::update_agent`]; unset fields are kept.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Replacement metadata. Must keep the agent id.
    pub metadata: Option<AgentMetadata>,
    /// Replacement code.
    pub code: Option<String>,
    /// Replacement manifest.
    pub manifest: Option<Value>,
}

/// The agent catalog.
///
/// Validates what gets published, keeps checksums and ratings consistent,
/// and announces every change on a broadcast bus.
pub struct AgentRegistry {
    store: Arc<dyn AgentStore>,
    engine: Arc<dyn ScriptEngine>,
    analyzer: CodeAnalyzer,
    security: Option<Arc<SecurityManager>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("security", &self.security.is_some())
            .finish_non_exhaustive()
    }
}

impl AgentRegistry {
    /// Creates a registry over `store`, checking syntax with `engine`.
    #[must_use]
    pub fn new(store: Arc<dyn AgentStore>, engine: Arc<dyn ScriptEngine>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            engine,
            analyzer: CodeAnalyzer::new(),
            security: None,
            events,
        }
    }

    /// Enforces grants through `security` and adopts its analyzer.
    #[must_use]
    pub fn with_security(mut self, security: Arc<SecurityManager>) -> Self {
        self.analyzer = security.analyzer().clone();
        self.security = Some(security);
        self
    }

    /// Subscribes to catalog changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Returns the backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AgentStore> {
        &self.store
    }

    async fn authorize(&self, user_id: &str, permission: Permission) -> RegistryResult<()> {
        if let Some(security) = &self.security {
            security.check_permission(user_id, permission).await?;
        }
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    async fn require(&self, id: AgentId) -> RegistryResult<AgentRegistryEntry> {
        self.store
            .get_agent(id)
            .await?
            .ok_or(RegistryError::AgentNotFound { id })
    }

    /// Validates and stores a new agent.
    ///
    /// # Errors
    ///
    /// Returns validation, syntax, size or blocked-pattern errors for bad
    /// input, [`RegistryError::NotAuthor`] when the metadata names someone
    /// else, and [`RegistryError::AlreadyExists`] for a reused id.
    pub async fn publish_agent(
        &self,
        request: PublishRequest,
        user_id: &str,
    ) -> RegistryResult<AgentRegistryEntry> {
        self.authorize(user_id, Permission::PublishAgents).await?;
        let id = request.metadata.id();
        if request.metadata.author() != user_id {
            return Err(RegistryError::NotAuthor {
                agent_id: id,
                user_id: user_id.to_owned(),
                action: "publish",
            });
        }
        validate_metadata(&request.metadata)?;
        if let Err(err) = validate_code(&request.code, self.engine.as_ref()) {
            warn!(agent_id = %id, user_id, error = %err, "publish rejected");
            return Err(err);
        }

        let analysis = self.analyzer.analyze(&request.code);
        let now = Utc::now();
        let entry = AgentRegistryEntry {
            checksum: compute_checksum(&request.code),
            metadata: request.metadata,
            code: request.code,
            manifest: request.manifest,
            verified: false,
            published_at: now,
            updated_at: now,
            download_count: 0,
            rating: 0.0,
            reviews: Vec::new(),
            analysis: Some(analysis),
        };
        self.store.save_agent(entry.clone()).await?;

        info!(
            agent_id = %id,
            author = user_id,
            risk = ?entry.analysis.as_ref().map(|analysis| analysis.risk_level),
            "agent published"
        );
        self.emit(RegistryEvent::Published {
            agent_id: id,
            author: user_id.to_owned(),
            checksum: entry.checksum.clone(),
        });
        Ok(entry)
    }

    /// Applies an author's update, re-validating whatever changed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AgentNotFound`], [`RegistryError::NotAuthor`],
    /// or any validation error from the new metadata or code.
    pub async fn update_agent(
        &self,
        id: AgentId,
        request: UpdateRequest,
        user_id: &str,
    ) -> RegistryResult<AgentRegistryEntry> {
        let current = self.require(id).await?;
        ensure_author(&current, user_id, "update")?;

        if let Some(metadata) = &request.metadata {
            if metadata.id() != id {
                return Err(RegistryError::validation("id", "agent id cannot change"));
            }
            if metadata.author() != current.metadata.author() {
                return Err(RegistryError::validation("author", "author cannot change"));
            }
            validate_metadata(metadata)?;
        }

        let mut update = AgentUpdate {
            metadata: request.metadata,
            manifest: request.manifest,
            ..AgentUpdate::default()
        };
        let mut code_changed = false;
        if let Some(code) = request.code {
            validate_code(&code, self.engine.as_ref())?;
            let checksum = compute_checksum(&code);
            if checksum != current.checksum {
                code_changed = true;
                update.analysis = Some(self.analyzer.analyze(&code));
                update.code = Some((code, checksum));
            }
        }

        let entry = self.store.update_agent(id, update).await?;
        info!(agent_id = %id, code_changed, "agent updated");
        self.emit(RegistryEvent::Updated {
            agent_id: id,
            code_changed,
        });
        Ok(entry)
    }

    /// Removes an agent at its author's request.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AgentNotFound`] or [`RegistryError::NotAuthor`].
    pub async fn delete_agent(&self, id: AgentId, user_id: &str) -> RegistryResult<AgentRegistryEntry> {
        let current = self.require(id).await?;
        ensure_author(&current, user_id, "delete")?;
        let removed = self.store.delete_agent(id).await?;
        info!(agent_id = %id, "agent deleted");
        self.emit(RegistryEvent::Deleted { agent_id: id });
        Ok(removed)
    }

    /// Records an install and returns the updated entry.
    ///
    /// Verification is not required.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AgentNotFound`] or a permission error.
    pub async fn install_agent(&self, id: AgentId, user_id: &str) -> RegistryResult<AgentRegistryEntry> {
        self.authorize(user_id, Permission::InstallAgents).await?;
        let download_count = self.store.increment_downloads(id).await?;
        let entry = self.require(id).await?;
        debug!(agent_id = %id, user_id, download_count, "agent installed");
        self.emit(RegistryEvent::Installed {
            agent_id: id,
            user_id: user_id.to_owned(),
            download_count,
        });
        Ok(entry)
    }

    /// Appends a review and recomputes the mean rating.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRating`] outside 1..=5,
    /// [`RegistryError::AgentNotFound`], or a permission error.
    pub async fn add_review(
        &self,
        id: AgentId,
        user_id: &str,
        rating: u8,
        comment: impl Into<String>,
    ) -> RegistryResult<AgentRegistryEntry> {
        if !(1..=5).contains(&rating) {
            return Err(RegistryError::InvalidRating { rating });
        }
        self.authorize(user_id, Permission::ReviewAgents).await?;
        let review = Review {
            id: ReviewId::random(),
            user_id: user_id.to_owned(),
            rating,
            comment: comment.into(),
            created_at: Utc::now(),
        };
        let entry = self.store.add_review(id, review).await?;
        debug!(agent_id = %id, user_id, rating, average = entry.rating, "review added");
        self.emit(RegistryEvent::Reviewed {
            agent_id: id,
            user_id: user_id.to_owned(),
            rating,
            average: entry.rating,
        });
        Ok(entry)
    }

    /// Sets the verification badge. Does not gate install or execution.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AgentNotFound`], or a permission error when a
    /// security manager is attached and `admin_id` lacks the verify grant.
    pub async fn verify_agent(
        &self,
        id: AgentId,
        verified: bool,
        admin_id: &str,
    ) -> RegistryResult<AgentRegistryEntry> {
        self.authorize(admin_id, Permission::VerifyAgents).await?;
        let entry = self
            .store
            .update_agent(
                id,
                AgentUpdate {
                    verified: Some(verified),
                    ..AgentUpdate::default()
                },
            )
            .await?;
        info!(agent_id = %id, verified, admin_id, "verification changed");
        self.emit(RegistryEvent::Verified {
            agent_id: id,
            verified,
            by: admin_id.to_owned(),
        });
        Ok(entry)
    }

    /// Fetches an entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AgentNotFound`] for an unknown id.
    pub async fn get_agent(&self, id: AgentId) -> RegistryResult<AgentRegistryEntry> {
        self.require(id).await
    }

    /// Passes a filtered listing through to the store.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn search(&self, query: &StoreQuery) -> RegistryResult<StorePage> {
        self.store.search_agents(query).await
    }

    /// Highest-rated agents in `category`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn agents_by_category(
        &self,
        category: &str,
        limit: usize,
    ) -> RegistryResult<Vec<AgentRegistryEntry>> {
        let query = StoreQuery {
            category: Some(category.to_owned()),
            ..sorted(SortField::Rating, limit)
        };
        Ok(self.store.search_agents(&query).await?.entries)
    }

    /// Most-installed agents.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn popular_agents(&self, limit: usize) -> RegistryResult<Vec<AgentRegistryEntry>> {
        Ok(self
            .store
            .search_agents(&sorted(SortField::DownloadCount, limit))
            .await?
            .entries)
    }

    /// Highest-rated agents.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn top_rated_agents(&self, limit: usize) -> RegistryResult<Vec<AgentRegistryEntry>> {
        Ok(self
            .store
            .search_agents(&sorted(SortField::Rating, limit))
            .await?
            .entries)
    }

    /// Every entry, unpaginated.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn snapshot(&self) -> RegistryResult<Vec<AgentRegistryEntry>> {
        Ok(self.store.search_agents(&StoreQuery::default()).await?.entries)
    }
}

fn ensure_author(
    entry: &AgentRegistryEntry,
    user_id: &str,
    action: &'static str,
) -> RegistryResult<()> {
    if entry.metadata.author() == user_id {
        return Ok(());
    }
    warn!(agent_id = %entry.metadata.id(), user_id, action, "non-author change refused");
    Err(RegistryError::NotAuthor {
        agent_id: entry.metadata.id(),
        user_id: user_id.to_owned(),
        action,
    })
}

fn sorted(sort: SortField, limit: usize) -> StoreQuery {
    StoreQuery {
        sort,
        order: SortOrder::Desc,
        limit: Some(limit),
        ..StoreQuery::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryAgentStore;
    use agent_policy::PolicyError;
    use agent_primitives::{AgentCapability, CapabilityId};
    use agent_sandbox::NativeEngine;

    const CODE: &str = "function summarize(input) { return input.text.slice(0, 50); }";

    fn metadata(author: &str) -> AgentMetadata {
        let capability = AgentCapability::builder(CapabilityId::new("summarize").unwrap())
            .name("summarize")
            .unwrap()
            .description("Summarize text")
            .build()
            .unwrap();
        AgentMetadata::builder(AgentId::random())
            .name("Summarizer")
            .unwrap()
            .version("1.0.0")
            .unwrap()
            .author(author)
            .unwrap()
            .description("Summarizes long documents")
            .category("productivity")
            .capabilities(vec![capability])
            .build()
            .unwrap()
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(InMemoryAgentStore::new()), Arc::new(NativeEngine::new()))
    }

    #[tokio::test]
    async fn publish_starts_unverified_and_unrated() {
        let registry = registry();
        let mut events = registry.subscribe();
        let entry = registry
            .publish_agent(PublishRequest::new(metadata("alice"), CODE), "alice")
            .await
            .unwrap();
        assert!(!entry.verified);
        assert_eq!(entry.download_count, 0);
        assert!(entry.reviews.is_empty());
        assert_eq!(entry.checksum, compute_checksum(CODE));
        assert!(entry.analysis.is_some());
        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::Published { .. }));
    }

    #[tokio::test]
    async fn publish_rejects_blocked_and_invalid_input() {
        let registry = registry();
        let err = registry
            .publish_agent(
                PublishRequest::new(metadata("alice"), "const x = require('os');"),
                "alice",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BlockedPattern { pattern: "require(" }));

        let short = metadata("alice")
            .into_builder()
            .name("ab")
            .unwrap()
            .build()
            .unwrap();
        let err = registry
            .publish_agent(PublishRequest::new(short, CODE), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation { field: "name", .. }));

        let err = registry
            .publish_agent(PublishRequest::new(metadata("alice"), CODE), "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotAuthor { .. }));
    }

    #[tokio::test]
    async fn update_recomputes_checksum_only_for_new_code() {
        let registry = registry();
        let entry = registry
            .publish_agent(PublishRequest::new(metadata("alice"), CODE), "alice")
            .await
            .unwrap();
        let id = entry.metadata.id();

        let same = registry
            .update_agent(
                id,
                UpdateRequest {
                    code: Some(CODE.to_owned()),
                    ..UpdateRequest::default()
                },
                "alice",
            )
            .await
            .unwrap();
        assert_eq!(same.checksum, entry.checksum);

        let changed_code = CODE.replace("50", "60");
        let changed = registry
            .update_agent(
                id,
                UpdateRequest {
                    code: Some(changed_code.clone()),
                    ..UpdateRequest::default()
                },
                "alice",
            )
            .await
            .unwrap();
        assert_eq!(changed.checksum, compute_checksum(&changed_code));
        assert_ne!(changed.checksum, entry.checksum);
        assert!(changed.updated_at >= entry.updated_at);

        let err = registry
            .update_agent(id, UpdateRequest::default(), "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotAuthor { action: "update", .. }));
        let err = registry.delete_agent(id, "bob").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotAuthor { action: "delete", .. }));
        registry.delete_agent(id, "alice").await.unwrap();
        assert!(matches!(
            registry.get_agent(id).await,
            Err(RegistryError::AgentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn install_and_reviews() {
        let registry = registry();
        let id = registry
            .publish_agent(PublishRequest::new(metadata("alice"), CODE), "alice")
            .await
            .unwrap()
            .metadata
            .id();

        let installed = registry.install_agent(id, "bob").await.unwrap();
        assert_eq!(installed.download_count, 1);
        assert!(!installed.verified);

        for rating in [5, 4, 3, 5, 4] {
            registry.add_review(id, "bob", rating, "ok").await.unwrap();
        }
        let entry = registry.get_agent(id).await.unwrap();
        assert!((entry.rating - 4.2).abs() < 1e-9);
        assert_eq!(entry.reviews.len(), 5);

        assert!(matches!(
            registry.add_review(id, "bob", 6, "").await,
            Err(RegistryError::InvalidRating { rating: 6 })
        ));
    }

    #[tokio::test]
    async fn verify_requires_grant_when_secured() {
        let security = Arc::new(SecurityManager::new());
        let registry = registry().with_security(Arc::clone(&security));
        let id = registry
            .publish_agent(PublishRequest::new(metadata("alice"), CODE), "alice")
            .await
            .unwrap()
            .metadata
            .id();

        let err = registry.verify_agent(id, true, "alice").await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Policy {
                source: PolicyError::PermissionDenied { .. }
            }
        ));

        security.grant("admin", Permission::VerifyAgents).await;
        let entry = registry.verify_agent(id, true, "admin").await.unwrap();
        assert!(entry.verified);
    }

    #[tokio::test]
    async fn convenience_queries_sort() {
        let registry = registry();
        let first = registry
            .publish_agent(PublishRequest::new(metadata("alice"), CODE), "alice")
            .await
            .unwrap()
            .metadata
            .id();
        let second = registry
            .publish_agent(PublishRequest::new(metadata("alice"), CODE), "alice")
            .await
            .unwrap()
            .metadata
            .id();
        registry.install_agent(second, "bob").await.unwrap();
        registry.add_review(first, "bob", 5, "great").await.unwrap();

        let popular = registry.popular_agents(1).await.unwrap();
        assert_eq!(popular[0].metadata.id(), second);
        let top = registry.top_rated_agents(10).await.unwrap();
        assert_eq!(top[0].metadata.id(), first);
        assert_eq!(registry.agents_by_category("productivity", 10).await.unwrap().len(), 2);
        assert!(registry.agents_by_category("finance", 10).await.unwrap().is_empty());
    }
}
