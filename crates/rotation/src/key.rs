//! Validated identifiers for secret records and rotation handlers
//!
//! [`RecordKey`] is the composite `(domain, entity)` key of a stored secret,
//! rendered as `domain__entity`. [`HandlerId`] names a registered handler.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

/// Maximum length of each key part and of handler ids
const MAX_PART_LENGTH: usize = 255;

/// Delimiter between the domain and entity parts of a rendered [`RecordKey`]
pub const KEY_DELIMITER: &str = "__";

/// Composite identifier of a [`SecretRecord`](crate::store::SecretRecord)
///
/// `domain` is the participant-specific grouping (for certificates: the
/// project name) and `entity` is the owner within it (the username).
///
/// # Examples
///
/// ```
/// use rekey_rotation::RecordKey;
///
/// let key = RecordKey::new("demo_project", "alice").unwrap();
/// assert_eq!(key.to_string(), "demo_project__alice");
///
/// let parsed: RecordKey = "demo_project__alice".parse().unwrap();
/// assert_eq!(parsed, key);
///
/// assert!(RecordKey::new("", "alice").is_err());
/// assert!(RecordKey::new("a__b", "alice").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey {
    domain: String,
    entity: String,
}

impl RecordKey {
    /// Creates a validated key from its two parts.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyKeyPart`] for an empty part and
    /// [`ValidationError::InvalidKeyPart`] when a part is too long, contains
    /// characters outside `[A-Za-z0-9._@-]` and single underscores, contains
    /// the `__` delimiter, or starts/ends with an underscore.
    pub fn new(domain: impl Into<String>, entity: impl Into<String>) -> Result<Self, ValidationError> {
        let domain = domain.into();
        let entity = entity.into();
        validate_part("domain", &domain)?;
        validate_part("entity", &entity)?;
        Ok(Self { domain, entity })
    }

    /// Participant-specific grouping (project name for certificates)
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Owning entity (username for certificates)
    pub fn entity(&self) -> &str {
        &self.entity
    }
}

fn validate_part(part: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyKeyPart { part });
    }

    if value.len() > MAX_PART_LENGTH {
        return Err(ValidationError::InvalidKeyPart {
            part,
            value: value.to_string(),
            reason: format!("exceeds maximum length of {MAX_PART_LENGTH} characters"),
        });
    }

    if value.contains(KEY_DELIMITER) || value.starts_with('_') || value.ends_with('_') {
        return Err(ValidationError::InvalidKeyPart {
            part,
            value: value.to_string(),
            reason: format!("must not contain '{KEY_DELIMITER}' or start/end with '_'"),
        });
    }

    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
    {
        return Err(ValidationError::InvalidKeyPart {
            part,
            value: value.to_string(),
            reason: "contains invalid characters (only alphanumeric, '-', '_', '.', '@' allowed)"
                .to_string(),
        });
    }

    Ok(())
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_DELIMITER}{}", self.domain, self.entity)
    }
}

impl std::str::FromStr for RecordKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, entity) = s
            .split_once(KEY_DELIMITER)
            .ok_or_else(|| ValidationError::MalformedKey {
                value: s.to_string(),
            })?;
        Self::new(domain, entity)
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for RecordKey {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Identity of a registered [`RotationHandler`](crate::handler::RotationHandler)
///
/// Only alphanumeric characters, hyphens, and underscores are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HandlerId(String);

impl HandlerId {
    /// Creates a validated handler id
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(ValidationError::EmptyHandlerId);
        }

        if id.len() > MAX_PART_LENGTH {
            return Err(ValidationError::InvalidHandlerId {
                id,
                reason: format!("exceeds maximum length of {MAX_PART_LENGTH} characters"),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidHandlerId {
                id,
                reason: "contains invalid characters (only alphanumeric, hyphens, underscores allowed)"
                    .to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Id from a compile-time constant known to be valid
    pub(crate) fn from_static(id: &'static str) -> Self {
        debug_assert!(Self::new(id).is_ok(), "invalid static handler id {id}");
        Self(id.to_string())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<HandlerId> for String {
    fn from(id: HandlerId) -> Self {
        id.0
    }
}

impl TryFrom<String> for HandlerId {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        HandlerId::new(s)
    }
}
