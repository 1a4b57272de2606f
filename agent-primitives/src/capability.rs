//! Capability descriptors shared across the exchange.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 64;
const MAX_NAME_LEN: usize = 96;
const MAX_TAG_LEN: usize = 64;

/// Identifier for a capability that an agent may expose.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(String);

impl CapabilityId {
    /// Creates a new capability identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapabilityId`] if the supplied identifier is empty,
    /// too long, or contains unsupported characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identifier(&id)?;
        Ok(Self(id))
    }

    /// Returns the capability identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<CapabilityId> for String {
    fn from(value: CapabilityId) -> Self {
        value.0
    }
}

fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidCapabilityId {
            id: String::new(),
            reason: "identifier cannot be empty".into(),
        });
    }

    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidCapabilityId {
            id: id.into(),
            reason: format!("identifier length must be <= {MAX_ID_LEN}"),
        });
    }

    if !id
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(Error::InvalidCapabilityId {
            id: id.into(),
            reason: "identifier must contain lowercase alphanumeric, dash, underscore, or dot"
                .into(),
        });
    }

    Ok(())
}

/// One independently invocable operation an agent exposes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    id: CapabilityId,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Value,
    #[serde(default)]
    output_schema: Value,
    #[serde(default)]
    category: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

impl AgentCapability {
    /// Starts building a capability descriptor.
    #[must_use]
    pub fn builder(id: CapabilityId) -> AgentCapabilityBuilder {
        AgentCapabilityBuilder {
            id,
            name: None,
            description: String::new(),
            input_schema: Value::Null,
            output_schema: Value::Null,
            category: String::new(),
            tags: BTreeSet::new(),
        }
    }

    /// Returns the unique capability identifier.
    #[must_use]
    pub fn id(&self) -> &CapabilityId {
        &self.id
    }

    /// Name used to invoke the capability.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description. May be empty until validated at publish.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// JSON schema describing accepted input.
    #[must_use]
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// JSON schema describing produced output.
    #[must_use]
    pub fn output_schema(&self) -> &Value {
        &self.output_schema
    }

    /// Capability category used by similarity scoring.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Free-form tags.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

/// Builder for [`AgentCapability`].
#[derive(Debug)]
pub struct AgentCapabilityBuilder {
    id: CapabilityId,
    name: Option<String>,
    description: String,
    input_schema: Value,
    output_schema: Value,
    category: String,
    tags: BTreeSet<String>,
}

impl AgentCapabilityBuilder {
    /// Sets the invocation name for the capability.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if the name is empty or exceeds the
    /// maximum supported length.
    pub fn name(mut self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidCapability {
                reason: "name cannot be empty".into(),
            });
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidCapability {
                reason: format!("name length must be <= {MAX_NAME_LEN}"),
            });
        }
        self.name = Some(name);
        Ok(self)
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the input shape descriptor.
    #[must_use]
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Sets the output shape descriptor.
    #[must_use]
    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    /// Sets the capability category.
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Adds a tag entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if the tag is empty or too long.
    pub fn add_tag(mut self, tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        if tag.trim().is_empty() {
            return Err(Error::InvalidCapability {
                reason: "tag cannot be empty".into(),
            });
        }
        if tag.len() > MAX_TAG_LEN {
            return Err(Error::InvalidCapability {
                reason: format!("tag length must be <= {MAX_TAG_LEN}"),
            });
        }
        self.tags.insert(tag);
        Ok(self)
    }

    /// Finalises the capability descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if no name was supplied.
    pub fn build(self) -> Result<AgentCapability> {
        let name = self.name.ok_or_else(|| Error::InvalidCapability {
            reason: "name must be provided".into(),
        })?;

        Ok(AgentCapability {
            id: self.id,
            name,
            description: self.description,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            category: self.category,
            tags: self.tags.into_iter().collect(),
        })
    }
}
