//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a single entity instance (unique within its entity type).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

/// Identifier of an issued command.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

/// Identifier of a domain event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(EntityId, "EntityId");
impl_uuid_newtype!(CommandId, "CommandId");
impl_uuid_newtype!(EventId, "EventId");

/// Addresses one entity instance across the whole system.
///
/// Rendered as `context/entity/id`, which is also the key used for the
/// per-entity lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityIdentifier {
    pub context_name: String,
    pub entity_name: String,
    pub id: EntityId,
}

impl EntityIdentifier {
    pub fn new(context_name: impl Into<String>, entity_name: impl Into<String>, id: EntityId) -> Self {
        Self {
            context_name: context_name.into(),
            entity_name: entity_name.into(),
            id,
        }
    }

    /// Key under which the per-entity lock is held.
    pub fn lock_key(&self) -> String {
        self.to_string()
    }
}

impl core::fmt::Display for EntityIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}/{}", self.context_name, self.entity_name, self.id)
    }
}

impl FromStr for EntityIdentifier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(context), Some(entity), Some(id)) if !context.is_empty() && !entity.is_empty() => {
                Ok(Self::new(context, entity, id.parse()?))
            }
            _ => Err(DomainError::invalid_id(format!(
                "EntityIdentifier: expected 'context/entity/id', got '{s}'"
            ))),
        }
    }
}

/// The actor that issued a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiator {
    pub user_id: String,
}

impl Initiator {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == "anonymous"
    }
}
