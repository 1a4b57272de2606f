//! Agent metadata advertised through the registry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AgentCapability, AgentId, UserId};

/// Resource defaults an agent declares for its executions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    /// Memory ceiling per execution in megabytes.
    pub memory_limit_mb: u32,
    /// Wall-clock limit per execution in milliseconds.
    pub timeout_limit_ms: u64,
    /// Invocations allowed per minute.
    pub rate_limit_per_minute: u32,
    /// Invocations allowed per hour.
    pub rate_limit_per_hour: u32,
}

impl ResourceDefaults {
    /// Returns the execution timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(self) -> Duration {
        Duration::from_millis(self.timeout_limit_ms)
    }
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            memory_limit_mb: 128,
            timeout_limit_ms: 30_000,
            rate_limit_per_minute: 60,
            rate_limit_per_hour: 1_000,
        }
    }
}

/// Description of a published agent's identity and capabilities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    id: AgentId,
    name: String,
    description: String,
    version: String,
    author: UserId,
    #[serde(default)]
    capabilities: Vec<AgentCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(default)]
    category: String,
    #[serde(default)]
    resources: ResourceDefaults,
}

impl AgentMetadata {
    /// Starts building an [`AgentMetadata`].
    #[must_use]
    pub fn builder(id: AgentId) -> AgentMetadataBuilder {
        AgentMetadataBuilder {
            id,
            name: None,
            description: String::new(),
            version: None,
            author: None,
            capabilities: Vec::new(),
            tags: Vec::new(),
            category: String::new(),
            resources: ResourceDefaults::default(),
        }
    }

    /// Reopens the metadata as a builder, keeping every field.
    #[must_use]
    pub fn into_builder(self) -> AgentMetadataBuilder {
        AgentMetadataBuilder {
            id: self.id,
            name: Some(self.name),
            description: self.description,
            version: Some(self.version),
            author: Some(self.author),
            capabilities: self.capabilities,
            tags: self.tags,
            category: self.category,
            resources: self.resources,
        }
    }

    /// Returns the agent identifier.
    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    /// Returns the agent display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the semantic version string identifying the agent build.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the publishing user.
    #[must_use]
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Returns the advertised capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &[AgentCapability] {
        &self.capabilities
    }

    /// Looks up a capability by its invocation name.
    #[must_use]
    pub fn capability(&self, name: &str) -> Option<&AgentCapability> {
        self.capabilities.iter().find(|cap| cap.name() == name)
    }

    /// Returns the tags associated with the agent.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Returns the catalog category.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Returns the declared resource defaults.
    #[must_use]
    pub const fn resources(&self) -> ResourceDefaults {
        self.resources
    }
}

/// Builder for [`AgentMetadata`].
#[derive(Debug)]
pub struct AgentMetadataBuilder {
    id: AgentId,
    name: Option<String>,
    description: String,
    version: Option<String>,
    author: Option<UserId>,
    capabilities: Vec<AgentCapability>,
    tags: Vec<String>,
    category: String,
    resources: ResourceDefaults,
}

impl AgentMetadataBuilder {
    /// Sets the human-readable name for the agent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidMetadata`] when the name is empty.
    pub fn name(mut self, name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(crate::Error::InvalidMetadata {
                reason: "name cannot be empty".into(),
            });
        }
        self.name = Some(name);
        Ok(self)
    }

    /// Sets the semantic version string.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidMetadata`] when the version string is empty.
    pub fn version(mut self, version: impl Into<String>) -> crate::Result<Self> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(crate::Error::InvalidMetadata {
                reason: "version cannot be empty".into(),
            });
        }
        self.version = Some(version);
        Ok(self)
    }

    /// Sets the publishing user.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidMetadata`] when the author is empty.
    pub fn author(mut self, author: impl Into<UserId>) -> crate::Result<Self> {
        let author = author.into();
        if author.trim().is_empty() {
            return Err(crate::Error::InvalidMetadata {
                reason: "author cannot be empty".into(),
            });
        }
        self.author = Some(author);
        Ok(self)
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replaces the capability set.
    #[must_use]
    pub fn capabilities(mut self, capabilities: Vec<AgentCapability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Replaces the tag set, dropping blank entries.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags
            .into_iter()
            .map(Into::into)
            .filter(|tag: &String| !tag.trim().is_empty())
            .collect();
        self
    }

    /// Sets the catalog category.
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Sets the resource defaults.
    #[must_use]
    pub fn resources(mut self, resources: ResourceDefaults) -> Self {
        self.resources = resources;
        self
    }

    /// Consumes the builder and returns the metadata.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidMetadata`] if name, version, or author is
    /// missing.
    pub fn build(self) -> crate::Result<AgentMetadata> {
        let name = self.name.ok_or_else(|| crate::Error::InvalidMetadata {
            reason: "name must be provided".into(),
        })?;
        let version = self.version.ok_or_else(|| crate::Error::InvalidMetadata {
            reason: "version must be provided".into(),
        })?;
        let author = self.author.ok_or_else(|| crate::Error::InvalidMetadata {
            reason: "author must be provided".into(),
        })?;

        Ok(AgentMetadata {
            id: self.id,
            name,
            description: self.description,
            version,
            author,
            capabilities: self.capabilities,
            tags: self.tags,
            category: self.category,
            resources: self.resources,
        })
    }
}
