use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use cairn_core::{CommandId, EntityIdentifier, Initiator};

/// Tracing metadata carried by a command.
///
/// `causation_id` points at whatever caused the command to be issued (for a
/// command issued directly by a client this is the command itself);
/// `correlation_id` groups every command and event of one business flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMetadata {
    pub causation_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub initiator: Initiator,
}

/// A request to change one entity, addressed by its identifier.
///
/// Commands are **immutable once issued**. They are consumed by exactly one
/// worker (modulo redelivery) and turned into domain events, or into a
/// rejection event when business logic refuses them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub entity_identifier: EntityIdentifier,
    pub name: String,
    pub data: JsonValue,
    pub metadata: CommandMetadata,
}

impl Command {
    /// Issue a fresh command that starts its own correlation chain.
    pub fn new(
        entity_identifier: EntityIdentifier,
        name: impl Into<String>,
        data: JsonValue,
        initiator: Initiator,
    ) -> Self {
        let id = CommandId::new();
        Self {
            id,
            entity_identifier,
            name: name.into(),
            data,
            metadata: CommandMetadata {
                causation_id: id.into(),
                correlation_id: id.into(),
                timestamp: Utc::now(),
                initiator,
            },
        }
    }
}
