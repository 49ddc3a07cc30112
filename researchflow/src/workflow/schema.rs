//! Expected shape of a request payload.

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON type a request field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// A string.
    String,
    /// A non-empty string.
    NonEmptyString,
    /// Any JSON number.
    Number,
    /// A non-negative integer.
    UnsignedInteger,
    /// A boolean.
    Boolean,
    /// An object.
    Object,
    /// An array.
    Array,
    /// Anything.
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::NonEmptyString => value.as_str().is_some_and(|s| !s.trim().is_empty()),
            Self::Number => value.is_number(),
            Self::UnsignedInteger => value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::NonEmptyString => "a non-empty string",
            Self::Number => "a number",
            Self::UnsignedInteger => "a non-negative integer",
            Self::Boolean => "a boolean",
            Self::Object => "an object",
            Self::Array => "an array",
            Self::Any => "any value",
        }
    }
}

/// Rule for one top-level field of the request object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Field name.
    pub name: String,
    /// Required JSON type.
    pub kind: FieldKind,
    /// Whether the field must be present.
    pub required: bool,
    /// Allowed string values; empty means unrestricted.
    #[serde(default)]
    pub allowed: Vec<String>,
}

/// A flat schema for request payloads.
///
/// Payloads must be JSON objects; unknown fields are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSchema {
    fields: Vec<FieldRule>,
}

impl InputSchema {
    /// A schema that accepts any object.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// The shape of a research request.
    #[must_use]
    pub fn research() -> Self {
        Self::any()
            .require("query", FieldKind::NonEmptyString)
            .optional_one_of("depth", &["shallow", "moderate", "deep"])
            .optional_one_of("language", &["zh", "en"])
            .optional("max_documents", FieldKind::UnsignedInteger)
            .optional("metadata", FieldKind::Object)
    }

    /// Adds a required field.
    #[must_use]
    pub fn require(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.with_rule(FieldRule {
            name: name.into(),
            kind,
            required: true,
            allowed: Vec::new(),
        })
    }

    /// Adds an optional field.
    #[must_use]
    pub fn optional(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.with_rule(FieldRule {
            name: name.into(),
            kind,
            required: false,
            allowed: Vec::new(),
        })
    }

    /// Adds an optional string field restricted to `allowed`.
    #[must_use]
    pub fn optional_one_of(self, name: impl Into<String>, allowed: &[&str]) -> Self {
        self.with_rule(FieldRule {
            name: name.into(),
            kind: FieldKind::String,
            required: false,
            allowed: allowed.iter().map(|s| (*s).to_string()).collect(),
        })
    }

    /// Adds a rule, replacing any rule for the same field.
    #[must_use]
    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.fields.retain(|r| r.name != rule.name);
        self.fields.push(rule);
        self
    }

    /// Returns the field rules.
    #[must_use]
    pub fn fields(&self) -> &[FieldRule] {
        &self.fields
    }

    /// Checks a payload against the schema.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        let Some(object) = payload.as_object() else {
            return Err(ValidationError::new("request payload must be a JSON object"));
        };

        for rule in &self.fields {
            match object.get(&rule.name) {
                None | Some(Value::Null) if rule.required => {
                    return Err(ValidationError::field(&rule.name, "is required"));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if !rule.kind.matches(value) {
                        return Err(ValidationError::field(
                            &rule.name,
                            format!("must be {}", rule.kind.describe()),
                        ));
                    }
                    if !rule.allowed.is_empty() {
                        let ok = value
                            .as_str()
                            .is_some_and(|s| rule.allowed.iter().any(|a| a == s));
                        if !ok {
                            return Err(ValidationError::field(
                                &rule.name,
                                format!("must be one of: {}", rule.allowed.join(", ")),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
