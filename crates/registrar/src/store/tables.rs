//! Logical tables of the coordination store.
//!
//! The layout mirrors what any backend persists: node status, resource
//! types, resources, associations, attributes (owned by either), change
//! records, subscribers, and the sequence counter. Rows are joined only by
//! surrogate ids and natural `(type, name)` keys.

use chrono::{DateTime, Utc};
use rollcall_common::{
    Association, Attributes, ChangeRecord, NodeRecord, Resource, ResourceKey, ResourceType,
    Subscriber,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRow {
    pub id: u64,
    pub key: ResourceKey,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationRow {
    pub id: u64,
    pub left_id: u64,
    pub right_id: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRow {
    pub id: u64,
    /// Id of the owning resource or association
    pub owner_id: u64,
    pub key: String,
    pub value: String,
}

/// All coordination state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    /// Last allocated change sequence
    pub sequence: u64,
    /// Last allocated surrogate id (shared by resources, associations, attributes)
    pub last_id: u64,
    pub resource_types: BTreeMap<String, ResourceType>,
    /// Keyed by (address, parent address)
    pub nodes: BTreeMap<(String, String), NodeRecord>,
    pub resources: BTreeMap<u64, ResourceRow>,
    pub resource_index: BTreeMap<ResourceKey, u64>,
    pub associations: BTreeMap<u64, AssociationRow>,
    pub attributes: BTreeMap<u64, AttributeRow>,
    pub resource_changes: BTreeMap<ResourceKey, ChangeRecord>,
    /// Keyed by (left key, right key)
    pub association_changes: BTreeMap<(ResourceKey, ResourceKey), ChangeRecord>,
    pub subscribers: BTreeSet<Subscriber>,
}

impl Tables {
    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    // === Resources ===

    pub fn resource_id(&self, key: &ResourceKey) -> Option<u64> {
        self.resource_index.get(key).copied()
    }

    pub fn key_of(&self, resource_id: u64) -> Option<&ResourceKey> {
        self.resources.get(&resource_id).map(|row| &row.key)
    }

    /// Resource with its attributes
    pub fn resource(&self, key: &ResourceKey) -> Option<Resource> {
        let row = self.resources.get(&self.resource_id(key)?)?;
        Some(Resource {
            id: row.id,
            key: row.key.clone(),
            version: row.version,
            attributes: self.attributes_of(row.id),
        })
    }

    pub fn insert_resource(&mut self, row: ResourceRow) {
        self.resource_index.insert(row.key.clone(), row.id);
        self.resources.insert(row.id, row);
    }

    /// Drop a resource row and the attributes it owns. Associations are
    /// left to the caller.
    pub fn remove_resource(&mut self, resource_id: u64) -> Option<ResourceRow> {
        let row = self.resources.remove(&resource_id)?;
        self.resource_index.remove(&row.key);
        self.remove_attributes_of(resource_id);
        Some(row)
    }

    // === Attributes ===

    pub fn attributes_of(&self, owner_id: u64) -> Attributes {
        self.attributes
            .values()
            .filter(|attr| attr.owner_id == owner_id)
            .map(|attr| (attr.key.clone(), attr.value.clone()))
            .collect()
    }

    pub fn attribute_ids_of(&self, owner_id: u64) -> BTreeMap<String, u64> {
        self.attributes
            .values()
            .filter(|attr| attr.owner_id == owner_id)
            .map(|attr| (attr.key.clone(), attr.id))
            .collect()
    }

    pub fn insert_attribute(&mut self, owner_id: u64, key: &str, value: &str) {
        let id = self.next_id();
        self.attributes.insert(
            id,
            AttributeRow {
                id,
                owner_id,
                key: key.to_string(),
                value: value.to_string(),
            },
        );
    }

    pub fn remove_attributes_of(&mut self, owner_id: u64) -> usize {
        let before = self.attributes.len();
        self.attributes.retain(|_, attr| attr.owner_id != owner_id);
        before - self.attributes.len()
    }

    // === Associations ===

    pub fn association_between(&self, left_id: u64, right_id: u64) -> Option<&AssociationRow> {
        self.associations
            .values()
            .find(|row| row.left_id == left_id && row.right_id == right_id)
    }

    pub fn outgoing_associations(&self, left_id: u64) -> Vec<AssociationRow> {
        self.associations
            .values()
            .filter(|row| row.left_id == left_id)
            .cloned()
            .collect()
    }

    /// Ids of every association with either endpoint in `resource_ids`
    pub fn association_ids_touching(&self, resource_ids: &BTreeSet<u64>) -> BTreeSet<u64> {
        self.associations
            .values()
            .filter(|row| resource_ids.contains(&row.left_id) || resource_ids.contains(&row.right_id))
            .map(|row| row.id)
            .collect()
    }

    /// Association with endpoint keys and attributes
    pub fn association(&self, left: &ResourceKey, right: &ResourceKey) -> Option<Association> {
        let left_id = self.resource_id(left)?;
        let right_id = self.resource_id(right)?;
        let row = self.association_between(left_id, right_id)?;
        Some(Association {
            id: row.id,
            left: left.clone(),
            right: right.clone(),
            left_id,
            right_id,
            attributes: self.attributes_of(row.id),
        })
    }

    /// Endpoint keys of an association row
    pub fn endpoints(&self, row: &AssociationRow) -> Option<(ResourceKey, ResourceKey)> {
        Some((
            self.key_of(row.left_id)?.clone(),
            self.key_of(row.right_id)?.clone(),
        ))
    }

    /// Drop an association row and the attributes it owns
    pub fn remove_association(&mut self, association_id: u64) -> Option<AssociationRow> {
        let row = self.associations.remove(&association_id)?;
        self.remove_attributes_of(association_id);
        Some(row)
    }
}
