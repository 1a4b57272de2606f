//! Catalog entries and reviews.

use agent_policy::CodeAnalysis;
use agent_primitives::{AgentMetadata, ReviewId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One user review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Review id.
    pub id: ReviewId,
    /// Reviewer.
    pub user_id: UserId,
    /// Rating in 1..=5.
    pub rating: u8,
    /// Free-form comment.
    pub comment: String,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

/// A published agent as held by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistryEntry {
    /// Agent metadata.
    pub metadata: AgentMetadata,
    /// Agent source text.
    pub code: String,
    /// Publisher-supplied manifest.
    pub manifest: Value,
    /// SHA-256 hex digest of `code`.
    pub checksum: String,
    /// Admin verification badge.
    pub verified: bool,
    /// First publish time.
    pub published_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Installs so far.
    pub download_count: u64,
    /// Mean review rating, `0.0` without reviews.
    pub rating: f64,
    /// Every review, oldest first.
    pub reviews: Vec<Review>,
    /// Advisory risk report computed at publish or update.
    pub analysis: Option<CodeAnalysis>,
}

impl AgentRegistryEntry {
    /// Lower-cased text searched by discovery and store queries.
    #[must_use]
    pub fn searchable_text(&self) -> String {
        let metadata = &self.metadata;
        let mut text = format!("{} {}", metadata.name(), metadata.description());
        for tag in metadata.tags() {
            text.push(' ');
            text.push_str(tag);
        }
        for capability in metadata.capabilities() {
            text.push(' ');
            text.push_str(capability.name());
            text.push(' ');
            text.push_str(capability.description());
        }
        text.to_lowercase()
    }

    pub(crate) fn push_review(&mut self, review: Review) {
        self.reviews.push(review);
        self.rating = mean_rating(&self.reviews);
    }
}

/// SHA-256 of `code` as lower-case hex.
#[must_use]
pub fn compute_checksum(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

/// Arithmetic mean of review ratings, `0.0` when empty.
#[must_use]
pub fn mean_rating(reviews: &[Review]) -> f64 {
    if reviews.is_empty() {
        return 0.0;
    }
    let total: u32 = reviews.iter().map(|review| u32::from(review.rating)).sum();
    #[allow(clippy::cast_precision_loss)]
    let count = reviews.len() as f64;
    f64::from(total) / count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_and_sensitive() {
        let code = "return input.text.slice(0, 10);";
        assert_eq!(compute_checksum(code), compute_checksum(code));
        assert_eq!(compute_checksum(code).len(), 64);
        assert_ne!(
            compute_checksum(code),
            compute_checksum("return input.text.slice(0, 11);")
        );
    }

    #[test]
    fn mean_of_reviews() {
        let reviews: Vec<_> = [5, 4, 3, 5, 4]
            .into_iter()
            .map(|rating| Review {
                id: ReviewId::random(),
                user_id: "u".into(),
                rating,
                comment: String::new(),
                created_at: Utc::now(),
            })
            .collect();
        assert!((mean_rating(&reviews) - 4.2).abs() < 1e-9);
        assert!(mean_rating(&[]).abs() < f64::EPSILON);
    }
}
