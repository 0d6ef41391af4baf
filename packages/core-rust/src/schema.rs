//! Channel definitions and schema validation.
//!
//! A channel is a device class: it owns a tag list and a typed field map
//! that together describe the telemetry its devices emit, the ordered list
//! of message handlers applied to inbound messages, and the access tokens a
//! device must present at admission. Definitions are persisted by an
//! external store; this module owns the shape and its validation rules.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum number of tags on a channel.
pub const MAX_TAGS: usize = 64;

/// Maximum number of fields on a channel.
pub const MAX_FIELDS: usize = 128;

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[A-Za-z0-9_]+$").expect("static pattern"))
}

// ---------------------------------------------------------------------------
// FieldType
// ---------------------------------------------------------------------------

/// Data type of a telemetry field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Float,
    Int,
    Boolean,
    String,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A device class definition.
///
/// Tags are free-form string dimensions attached to every indexed document;
/// fields are the typed measurements. Tag names and field names share one
/// namespace. Once a channel exists, tags and fields may be added but never
/// removed, and a field's type may never change — downstream indices would
/// otherwise hold mixed-type columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Assigned by the store; definitions loaded from seed files omit it.
    #[serde(default)]
    pub id: u64,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
    /// Handler names applied to inbound messages, outermost first.
    #[serde(default)]
    pub message_handlers: Vec<String>,
    pub access_tokens: Vec<String>,
}

impl Channel {
    /// Validates a definition against the creation rules.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule as a [`ValidationError`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.description.is_empty() {
            return Err(ValidationError::EmptyDescription);
        }
        if self.access_tokens.is_empty() {
            return Err(ValidationError::NoAccessTokens);
        }

        if self.tags.len() > MAX_TAGS {
            return Err(ValidationError::TooManyTags {
                count: self.tags.len(),
            });
        }

        let mut seen = std::collections::HashSet::with_capacity(self.tags.len());
        for tag in &self.tags {
            if !name_pattern().is_match(tag) {
                return Err(ValidationError::InvalidTagName { name: tag.clone() });
            }
            if !seen.insert(tag.as_str()) {
                return Err(ValidationError::DuplicateTag { name: tag.clone() });
            }
            if self.fields.contains_key(tag) {
                return Err(ValidationError::TagFieldCollision { name: tag.clone() });
            }
        }

        if self.fields.is_empty() {
            return Err(ValidationError::NoFields);
        }
        if self.fields.len() > MAX_FIELDS {
            return Err(ValidationError::TooManyFields {
                count: self.fields.len(),
            });
        }
        for name in self.fields.keys() {
            if !name_pattern().is_match(name) {
                return Err(ValidationError::InvalidFieldName { name: name.clone() });
            }
        }

        Ok(())
    }

    /// Validates this definition as an update of `prev`.
    ///
    /// On top of [`validate`](Self::validate): tags may not be removed,
    /// fields may not be removed, and field types may not change.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule as a [`ValidationError`].
    pub fn validate_update(&self, prev: &Self) -> Result<(), ValidationError> {
        for tag in &prev.tags {
            if !self.tags.contains(tag) {
                return Err(ValidationError::TagRemoved { name: tag.clone() });
            }
        }

        for (name, prev_type) in &prev.fields {
            match self.fields.get(name) {
                None => {
                    return Err(ValidationError::FieldRemoved { name: name.clone() });
                }
                Some(new_type) if new_type != prev_type => {
                    return Err(ValidationError::FieldTypeChanged { name: name.clone() });
                }
                Some(_) => {}
            }
        }

        self.validate()
    }
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A violated channel schema rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("name is empty")]
    EmptyName,

    #[error("description is empty")]
    EmptyDescription,

    #[error("access_tokens are empty")]
    NoAccessTokens,

    #[error("fields are empty")]
    NoFields,

    #[error("too many tags: {count} exceeds the limit of {MAX_TAGS}")]
    TooManyTags { count: usize },

    #[error("too many fields: {count} exceeds the limit of {MAX_FIELDS}")]
    TooManyFields { count: usize },

    #[error("invalid tag name {name:?}: only letters, numbers and underscores are allowed")]
    InvalidTagName { name: String },

    #[error("invalid field name {name:?}: only letters, numbers and underscores are allowed")]
    InvalidFieldName { name: String },

    #[error("duplicate tag name: {name}")]
    DuplicateTag { name: String },

    #[error("tag name {name} is already defined as a field")]
    TagFieldCollision { name: String },

    #[error("removing a tag is not allowed: {name}")]
    TagRemoved { name: String },

    #[error("removing a field is not allowed: {name}")]
    FieldRemoved { name: String },

    #[error("changing a field type is not allowed: {name}")]
    FieldTypeChanged { name: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
