//! Tags: the consistency and read scopes events are attached to.
//!
//! A tag is written as `group:content`. Consistency tags take part in the
//! reservation protocol at write time; non-consistency tags only group
//! events for reads and never block a writer.

use std::fmt;

use crate::error::DcbError;
use crate::sortable_id::SortableUniqueId;

/// Maximum length of the group part, in characters.
pub const MAX_GROUP_LENGTH: usize = 40;
/// Maximum length of the content part, in characters.
pub const MAX_CONTENT_LENGTH: usize = 80;

const DELIMITER: char = ':';

/// How a tag participates in optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagConsistency {
    /// Reserved before every write. `expected` pins the version the writer
    /// requires; when `None` the version is taken from what the command
    /// read.
    Consistent {
        /// Explicitly pinned expected version.
        expected: Option<SortableUniqueId>,
    },
    /// Never reserved. Writes only nudge readers to refresh.
    NonConsistent,
}

/// A `group:content` scope attached to events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    group: String,
    content: String,
    consistency: TagConsistency,
}

impl Tag {
    /// A consistency tag with no pinned version.
    pub fn consistency(group: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            content: content.into(),
            consistency: TagConsistency::Consistent { expected: None },
        }
    }

    /// A read-only tag that never takes a reservation.
    pub fn non_consistency(group: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            content: content.into(),
            consistency: TagConsistency::NonConsistent,
        }
    }

    /// Split a `group:content` string into a consistency tag.
    ///
    /// Splits on the first `:`. A string without a delimiter becomes a tag
    /// with empty content, which [`validate`](Tag::validate) rejects.
    pub fn parse(value: &str) -> Self {
        let (group, content) = value.split_once(DELIMITER).unwrap_or((value, ""));
        Self::consistency(group, content)
    }

    /// Pin the version this tag must be at for the write to proceed.
    ///
    /// Turns a non-consistency tag into a consistency tag.
    pub fn with_expected(mut self, expected: SortableUniqueId) -> Self {
        self.consistency = TagConsistency::Consistent {
            expected: Some(expected),
        };
        self
    }

    /// The group part.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The content part.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// How this tag participates in reservations.
    pub fn consistency_mode(&self) -> &TagConsistency {
        &self.consistency
    }

    /// Returns `true` if writes must reserve this tag.
    pub fn is_consistency(&self) -> bool {
        matches!(self.consistency, TagConsistency::Consistent { .. })
    }

    /// The pinned expected version, if any.
    pub fn expected_version(&self) -> Option<&SortableUniqueId> {
        match &self.consistency {
            TagConsistency::Consistent { expected } => expected.as_ref(),
            TagConsistency::NonConsistent => None,
        }
    }

    /// The `group:content` form. Also the tag consistency actor key.
    pub fn tag_string(&self) -> String {
        format!("{}{DELIMITER}{}", self.group, self.content)
    }

    /// Check structural rules, returning every violation found.
    pub fn validate(&self) -> Vec<TagValidationError> {
        let tag = self.tag_string();
        let mut errors = Vec::new();

        if self.group.is_empty() {
            errors.push(TagValidationError::EmptyGroup { tag: tag.clone() });
        } else {
            if !self.group.chars().all(is_allowed_char) {
                errors.push(TagValidationError::InvalidCharactersInGroup {
                    tag: tag.clone(),
                    group: self.group.clone(),
                });
            }
            let len = self.group.chars().count();
            if len > MAX_GROUP_LENGTH {
                errors.push(TagValidationError::GroupTooLong {
                    tag: tag.clone(),
                    actual: len,
                });
            }
        }

        if self.content.is_empty() {
            errors.push(TagValidationError::EmptyContent { tag });
        } else {
            if !self.content.chars().all(is_allowed_char) {
                errors.push(TagValidationError::InvalidCharactersInContent {
                    tag: tag.clone(),
                    content: self.content.clone(),
                });
            }
            let len = self.content.chars().count();
            if len > MAX_CONTENT_LENGTH {
                errors.push(TagValidationError::ContentTooLong { tag, actual: len });
            }
        }

        errors
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{DELIMITER}{}", self.group, self.content)
    }
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Validate every tag, failing with all violations at once.
///
/// # Errors
///
/// Returns [`DcbError::InvalidTags`] carrying every violation across all tags.
pub fn validate_tags<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Result<(), DcbError> {
    let errors: Vec<TagValidationError> = tags.into_iter().flat_map(Tag::validate).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DcbError::InvalidTags(errors))
    }
}

/// A single structural problem with a tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagValidationError {
    /// Nothing before the `:`.
    #[error("tag '{tag}': group must not be empty")]
    EmptyGroup {
        /// The offending tag string.
        tag: String,
    },

    /// Nothing after the `:` (or no `:` at all).
    #[error("tag '{tag}': content must not be empty")]
    EmptyContent {
        /// The offending tag string.
        tag: String,
    },

    /// The group uses characters outside `[A-Za-z0-9._-]`.
    #[error("tag '{tag}': group '{group}' contains invalid characters (allowed: A-Z, a-z, 0-9, '.', '_', '-')")]
    InvalidCharactersInGroup {
        /// The offending tag string.
        tag: String,
        /// The group part.
        group: String,
    },

    /// The content uses characters outside `[A-Za-z0-9._-]`.
    #[error("tag '{tag}': content '{content}' contains invalid characters (allowed: A-Z, a-z, 0-9, '.', '_', '-')")]
    InvalidCharactersInContent {
        /// The offending tag string.
        tag: String,
        /// The content part.
        content: String,
    },

    /// The group is longer than [`MAX_GROUP_LENGTH`].
    #[error("tag '{tag}': group exceeds maximum length of {} (actual: {actual})", MAX_GROUP_LENGTH)]
    GroupTooLong {
        /// The offending tag string.
        tag: String,
        /// Actual length in characters.
        actual: usize,
    },

    /// The content is longer than [`MAX_CONTENT_LENGTH`].
    #[error("tag '{tag}': content exceeds maximum length of {} (actual: {actual})", MAX_CONTENT_LENGTH)]
    ContentTooLong {
        /// The offending tag string.
        tag: String,
        /// Actual length in characters.
        actual: usize,
    },
}

/// Identity of one tag state actor: a tag plus a projector name.
///
/// Renders as `group:content:projector`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagStateId {
    /// Tag group.
    pub tag_group: String,
    /// Tag content.
    pub tag_content: String,
    /// Projector name.
    pub projector: String,
}

impl TagStateId {
    /// Identity for `tag` projected by `projector`.
    pub fn new(tag: &Tag, projector: impl Into<String>) -> Self {
        Self {
            tag_group: tag.group().to_string(),
            tag_content: tag.content().to_string(),
            projector: projector.into(),
        }
    }

    /// The `group:content` key of the owning tag consistency actor.
    pub fn tag_string(&self) -> String {
        format!("{}{DELIMITER}{}", self.tag_group, self.tag_content)
    }

    /// Parse `group:content:projector`.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::IdentityMismatch`] when the string does not have
    /// three non-empty parts.
    pub fn parse(value: &str) -> Result<Self, DcbError> {
        let mut parts = value.splitn(3, DELIMITER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(group), Some(content), Some(projector))
                if !group.is_empty() && !content.is_empty() && !projector.is_empty() =>
            {
                Ok(Self {
                    tag_group: group.to_string(),
                    tag_content: content.to_string(),
                    projector: projector.to_string(),
                })
            }
            _ => Err(DcbError::IdentityMismatch {
                expected: "group:content:projector".to_string(),
                actual: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for TagStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIMITER}{}{DELIMITER}{}",
            self.tag_group, self.tag_content, self.projector
        )
    }
}
