use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use cairn_core::EntityIdentifier;

/// Cached materialization of an entity's state at a specific revision.
///
/// Never authoritative: `state` must equal the result of replaying every event
/// with `revision <= self.revision`, and can always be re-derived that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub entity_identifier: EntityIdentifier,
    pub revision: u64,
    pub state: JsonValue,
}
