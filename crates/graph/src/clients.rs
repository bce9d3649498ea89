//! Collaborators the item transfer worker fetches from.
//!
//! Implementations talk to a digital twin registry, to submodel endpoints
//! and to a semantic model hub. The worker only sees these traits, so tests
//! and the demo plug in the in-memory variants from [`crate::testing`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use partchain_core::{ErrorCause, ItemKey, ToErrorCause};

use crate::model::{Relationship, RelationshipAspect, Shell};

/// Failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("payload could not be parsed: {0}")]
    InvalidPayload(String),
    #[error("usage policy rejected: {0}")]
    UsagePolicy(String),
    #[error("schema not found: {0}")]
    SchemaNotFound(String),
}

impl FetchError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::NotFound(_) => "NotFound",
            FetchError::Transport(_) => "Transport",
            FetchError::InvalidPayload(_) => "InvalidPayload",
            FetchError::UsagePolicy(_) => "UsagePolicy",
            FetchError::SchemaNotFound(_) => "SchemaNotFound",
        }
    }
}

impl ToErrorCause for FetchError {
    fn to_error_cause(&self) -> ErrorCause {
        ErrorCause::new(self.kind(), self.to_string())
    }
}

/// A registry that resolves item keys to shells.
#[async_trait]
pub trait DigitalTwinRegistry: Send + Sync {
    /// Address reported on tombstones when the lookup fails.
    fn endpoint(&self) -> &str;

    async fn lookup_shell(&self, key: &ItemKey) -> Result<Shell, FetchError>;
}

#[async_trait]
pub trait SubmodelClient: Send + Sync {
    /// Relationships published at `endpoint` for one item.
    async fn relationships(
        &self,
        endpoint: &str,
        aspect: RelationshipAspect,
    ) -> Result<Vec<Relationship>, FetchError>;

    /// Raw submodel payload, fetched on behalf of `bpn`.
    async fn submodel_payload(
        &self,
        endpoint: &str,
        bpn: &str,
    ) -> Result<serde_json::Value, FetchError>;
}

/// Minimal schema of an aspect: the properties a payload must carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectSchema {
    pub required: Vec<String>,
}

impl AspectSchema {
    pub fn requiring<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: properties.into_iter().map(Into::into).collect(),
        }
    }

    /// Validation errors of `payload`; empty when it conforms.
    pub fn validate(&self, payload: &serde_json::Value) -> Vec<String> {
        let Some(object) = payload.as_object() else {
            return vec!["payload is not a JSON object".to_string()];
        };
        self.required
            .iter()
            .filter(|property| !object.contains_key(property.as_str()))
            .map(|property| format!("required property '{property}' not found"))
            .collect()
    }
}

/// Source of aspect schemas for payload validation.
#[async_trait]
pub trait SemanticsHub: Send + Sync {
    async fn model_schema(&self, aspect_type: &str) -> Result<AspectSchema, FetchError>;
}
