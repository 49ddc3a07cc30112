//! Typed research requests.

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on `max_documents`.
pub const MAX_DOCUMENTS_LIMIT: u32 = 1000;

/// How thorough the research should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchDepth {
    /// A quick overview.
    Shallow,
    /// A balanced survey.
    #[default]
    Moderate,
    /// An exhaustive review.
    Deep,
}

/// Output language of the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// Chinese.
    #[default]
    Zh,
    /// English.
    En,
}

fn default_max_documents() -> u32 {
    100
}

/// A research request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRequest {
    /// The research question.
    pub query: String,
    /// Research depth.
    #[serde(default)]
    pub depth: ResearchDepth,
    /// Report language.
    #[serde(default)]
    pub language: Language,
    /// Maximum number of documents to collect.
    #[serde(default = "default_max_documents")]
    pub max_documents: u32,
    /// Free-form caller metadata.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl ResearchRequest {
    /// Creates a request with default settings.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            depth: ResearchDepth::default(),
            language: Language::default(),
            max_documents: default_max_documents(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Sets the depth.
    #[must_use]
    pub const fn with_depth(mut self, depth: ResearchDepth) -> Self {
        self.depth = depth;
        self
    }

    /// Sets the language.
    #[must_use]
    pub const fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    /// Sets the document limit.
    #[must_use]
    pub const fn with_max_documents(mut self, max: u32) -> Self {
        self.max_documents = max;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Checks the request.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for a blank query or a document limit
    /// outside `1..=1000`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.query.trim().is_empty() {
            return Err(ValidationError::field("query", "must not be empty"));
        }
        if !(1..=MAX_DOCUMENTS_LIMIT).contains(&self.max_documents) {
            return Err(ValidationError::field(
                "max_documents",
                format!("must be between 1 and {MAX_DOCUMENTS_LIMIT}"),
            ));
        }
        Ok(())
    }

    /// Converts the request into the payload stored on the task.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the request cannot be serialized.
    pub fn to_payload(&self) -> Result<Value, ValidationError> {
        serde_json::to_value(self).map_err(|e| ValidationError::new(e.to_string()))
    }
}
