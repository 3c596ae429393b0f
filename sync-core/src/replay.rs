//! State replay: folding an ordered run of operations into a projection.
//!
//! The projection is `entity type -> entity id -> merged payload`. Replay is
//! pure; the snapshot engine feeds it batches read from storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use sync_types::{OpKind, ServerOperation};

/// A materialized view of the operation log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Projection(BTreeMap<String, BTreeMap<String, Value>>);

impl Projection {
    /// Empty projection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a projection from a cached JSON state.
    ///
    /// Fails when the cached bytes don't have the expected two-level shape,
    /// which callers treat as a corrupt cache (discard and rebuild).
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Serialize the projection for caching or the snapshot response.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("projection serializes")
    }

    /// Look up an entity's merged payload.
    pub fn entity(&self, entity_type: &str, entity_id: &str) -> Option<&Value> {
        self.0.get(entity_type)?.get(entity_id)
    }

    /// Number of entities of a given type.
    pub fn entity_count(&self, entity_type: &str) -> usize {
        self.0.get(entity_type).map(BTreeMap::len).unwrap_or(0)
    }

    /// Whether the projection holds no entities at all.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    /// Apply one operation in log order.
    ///
    /// Returns `false` when the operation was skipped (encrypted payloads
    /// are opaque and cannot be merged server-side).
    pub fn apply(&mut self, op: &ServerOperation) -> bool {
        if op.is_payload_encrypted {
            return false;
        }

        if op.op_kind.is_full_state() {
            self.replace_all(&op.payload);
            return true;
        }

        match op.op_kind {
            OpKind::Create => {
                if let Some(id) = &op.entity_id {
                    self.entities_mut(&op.entity_type)
                        .insert(id.clone(), op.payload.clone());
                }
            }
            OpKind::Update | OpKind::Move => {
                if let Some(id) = &op.entity_id {
                    if !op.payload.is_null() {
                        let slot = self
                            .entities_mut(&op.entity_type)
                            .entry(id.clone())
                            .or_insert(Value::Null);
                        merge_shallow(slot, &op.payload);
                    }
                }
            }
            OpKind::Delete => {
                if let Some(id) = &op.entity_id {
                    if let Some(entities) = self.0.get_mut(&op.entity_type) {
                        entities.remove(id);
                    }
                }
            }
            OpKind::Batch => self.apply_batch(op),
            // Full-state kinds were handled above.
            OpKind::SyncImport | OpKind::BackupImport | OpKind::Repair => {}
        }
        true
    }

    fn apply_batch(&mut self, op: &ServerOperation) {
        let Value::Object(payload) = &op.payload else {
            return;
        };
        match payload.get("entities") {
            Some(Value::Object(entities)) => {
                for (id, entity) in entities {
                    let slot = self
                        .entities_mut(&op.entity_type)
                        .entry(id.clone())
                        .or_insert(Value::Null);
                    merge_shallow(slot, entity);
                }
            }
            _ => {
                if let Some(id) = &op.entity_id {
                    let slot = self
                        .entities_mut(&op.entity_type)
                        .entry(id.clone())
                        .or_insert(Value::Null);
                    merge_shallow(slot, &op.payload);
                }
            }
        }
    }

    /// Replace the entire projection with a full-state payload.
    ///
    /// Everything before a restore point is logically superseded, for all
    /// entity types, not just the ones the payload mentions.
    fn replace_all(&mut self, payload: &Value) {
        self.0.clear();
        if let Value::Object(map) = payload {
            for (entity_type, entities) in map {
                if let Value::Object(entities) = entities {
                    self.0.insert(
                        entity_type.clone(),
                        entities
                            .iter()
                            .map(|(id, v)| (id.clone(), v.clone()))
                            .collect(),
                    );
                }
            }
        }
    }

    fn entities_mut(&mut self, entity_type: &str) -> &mut BTreeMap<String, Value> {
        self.0.entry(entity_type.to_string()).or_default()
    }
}

/// Shallow object merge: keys from `patch` overwrite keys in `slot`.
/// Non-object operands degrade to replacement.
fn merge_shallow(slot: &mut Value, patch: &Value) {
    match (slot, patch) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                base.insert(key.clone(), value.clone());
            }
        }
        (slot, patch) => *slot = patch.clone(),
    }
}
