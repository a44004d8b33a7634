//! Resources, associations, and the attribute diff engine.
//!
//! Every write is diffed against what is stored: an identical write is a
//! no-op and produces no change record.

use rollcall_common::constants::INITIAL_VERSION;
use rollcall_common::error::require_text;
use rollcall_common::{
    Association, Attributes, CallerContext, ChangeKind, ChangeSubject, Resource, ResourceKey,
    ResourceType, RollcallError, RollcallResult,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::changelog::put_change;
use crate::store::{AssociationRow, Gateway, ResourceRow, Tables, Tx};

/// Desired outgoing associations of a resource, keyed by right-side name
pub type AssociationTargets = BTreeMap<String, Attributes>;

pub struct ResourceGraph<G> {
    gateway: Arc<G>,
}

impl<G: Gateway> ResourceGraph<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    /// Register a type; a name that is already registered is left untouched.
    ///
    /// Returns whether the type was newly registered.
    pub async fn register_resource_type(&self, resource_type: &ResourceType) -> RollcallResult<bool> {
        require_text(&resource_type.name, "resource type")?;
        self.gateway
            .transaction(|tx| {
                if tx.tables.resource_types.contains_key(&resource_type.name) {
                    return Ok(false);
                }
                tx.tables
                    .resource_types
                    .insert(resource_type.name.clone(), resource_type.clone());
                Ok(true)
            })
            .await
    }

    pub async fn resource_type(&self, name: &str) -> RollcallResult<Option<ResourceType>> {
        self.gateway
            .read(|tables, _| Ok(tables.resource_types.get(name).cloned()))
            .await
    }

    pub async fn get_resource(&self, key: &ResourceKey) -> RollcallResult<Option<Resource>> {
        key.validate()?;
        self.gateway.read(|tables, _| Ok(tables.resource(key))).await
    }

    pub async fn get_association(
        &self,
        left: &ResourceKey,
        right: &ResourceKey,
    ) -> RollcallResult<Option<Association>> {
        left.validate()?;
        right.validate()?;
        self.gateway
            .read(|tables, _| Ok(tables.association(left, right)))
            .await
    }

    /// Ids of the named resources that exist
    pub async fn resource_ids_by_names(
        &self,
        resource_type: &str,
        names: &BTreeSet<String>,
    ) -> RollcallResult<BTreeMap<String, u64>> {
        require_text(resource_type, "resource type")?;
        self.gateway
            .read(|tables, _| Ok(ids_by_names(tables, resource_type, names)))
            .await
    }

    /// Upsert a resource and, when `right_type` is given, reconcile its
    /// outgoing associations to that type with `targets`.
    ///
    /// Outgoing associations to `right_type` that are not in `targets` are
    /// removed. Everything commits in one transaction; an unknown target
    /// name rejects the whole call.
    pub async fn add_or_update_resource(
        &self,
        resource: &Resource,
        right_type: Option<&str>,
        targets: Option<&AssociationTargets>,
        ctx: &CallerContext,
    ) -> RollcallResult<Resource> {
        resource.key.validate()?;
        validate_attributes(&resource.attributes)?;
        ctx.validate()?;
        if let Some(right_type) = right_type {
            require_text(right_type, "right resource type")?;
        }
        for attributes in targets.into_iter().flat_map(|t| t.values()) {
            validate_attributes(attributes)?;
        }

        self.gateway
            .transaction(|tx| {
                let left_type = registered_type(tx.tables, &resource.key.resource_type)?;
                let empty = AssociationTargets::new();
                let resolved = match right_type {
                    Some(right_type) => {
                        registered_type(tx.tables, right_type)?;
                        let targets = targets.unwrap_or(&empty);
                        Some((right_type, resolve_targets(tx.tables, right_type, targets)?))
                    }
                    None => None,
                };

                let (resource_id, resource_kind) = upsert_resource(tx, resource);
                let mut edge_changes = Vec::new();
                if let Some((right_type, resolved)) = resolved {
                    edge_changes =
                        reconcile_associations(tx, resource_id, right_type, resolved, resource_kind);
                }

                let online = left_type.is_online_resource;
                if let Some(kind) = resource_kind {
                    put_change(tx, ChangeSubject::resource(resource.key.clone()), kind, ctx, online);
                }
                for (right, kind) in edge_changes {
                    let subject = ChangeSubject::association(resource.key.clone(), right);
                    put_change(tx, subject, kind, ctx, online);
                }

                tx.tables.resource(&resource.key).ok_or_else(|| {
                    RollcallError::Store(format!("resource {} vanished mid-write", resource.key))
                })
            })
            .await
    }

    /// Upsert a single association between two existing resources
    pub async fn add_or_update_association(
        &self,
        left: &ResourceKey,
        right: &ResourceKey,
        attributes: &Attributes,
        ctx: &CallerContext,
    ) -> RollcallResult<Association> {
        left.validate()?;
        right.validate()?;
        validate_attributes(attributes)?;
        ctx.validate()?;

        self.gateway
            .transaction(|tx| {
                let online = registered_type(tx.tables, &left.resource_type)?.is_online_resource;
                let left_id = existing_id(tx.tables, left)?;
                let right_id = existing_id(tx.tables, right)?;

                let kind = match tx.tables.association_between(left_id, right_id).map(|row| row.id) {
                    Some(id) => sync_attributes(tx.tables, id, attributes).then_some(ChangeKind::Updated),
                    None => {
                        insert_association(tx, left_id, right_id, attributes);
                        Some(ChangeKind::Created)
                    }
                };
                if let Some(kind) = kind {
                    let subject = ChangeSubject::association(left.clone(), right.clone());
                    put_change(tx, subject, kind, ctx, online);
                }

                tx.tables.association(left, right).ok_or_else(|| {
                    RollcallError::Store(format!("association {left} -> {right} vanished mid-write"))
                })
            })
            .await
    }

    /// Remove one association; returns whether it existed
    pub async fn remove_association(
        &self,
        left: &ResourceKey,
        right: &ResourceKey,
        ctx: &CallerContext,
    ) -> RollcallResult<bool> {
        left.validate()?;
        right.validate()?;
        ctx.validate()?;

        self.gateway
            .transaction(|tx| {
                let Some(id) = tx
                    .tables
                    .association(left, right)
                    .map(|association| association.id)
                else {
                    return Ok(false);
                };
                tx.tables.remove_association(id);
                let subject = ChangeSubject::association(left.clone(), right.clone());
                put_change(tx, subject, ChangeKind::Deleted, ctx, false);
                Ok(true)
            })
            .await
    }

    /// Delete the named resources of a non-historic type together with every
    /// association touching them. Names that do not exist are skipped.
    ///
    /// Returns the number of resources removed.
    pub async fn remove_non_historic_resources_by_names(
        &self,
        resource_type: &str,
        names: &BTreeSet<String>,
        ctx: &CallerContext,
    ) -> RollcallResult<usize> {
        require_text(resource_type, "resource type")?;
        ctx.validate()?;

        self.gateway
            .transaction(|tx| {
                let declared = registered_type(tx.tables, resource_type)?;
                if declared.keep_historic {
                    return Err(RollcallError::conflict(format!(
                        "resources of type {resource_type} keep history and can not be removed"
                    )));
                }

                let doomed = ids_by_names(tx.tables, resource_type, names);
                let ids: BTreeSet<u64> = doomed.values().copied().collect();

                for id in tx.tables.association_ids_touching(&ids) {
                    let ends = tx
                        .tables
                        .associations
                        .get(&id)
                        .and_then(|row| tx.tables.endpoints(row));
                    tx.tables.remove_association(id);
                    if let Some((left, right)) = ends {
                        let subject = ChangeSubject::association(left, right);
                        put_change(tx, subject, ChangeKind::Deleted, ctx, false);
                    }
                }
                for (name, id) in &doomed {
                    tx.tables.remove_resource(*id);
                    let subject = ChangeSubject::resource(ResourceKey::new(resource_type, name));
                    put_change(tx, subject, ChangeKind::Deleted, ctx, false);
                }

                Ok(doomed.len())
            })
            .await
    }
}

fn validate_attributes(attributes: &Attributes) -> RollcallResult<()> {
    for (key, value) in attributes {
        require_text(key, "attribute key")?;
        require_text(value, &format!("value of attribute {key}"))?;
    }
    Ok(())
}

fn registered_type(tables: &Tables, name: &str) -> RollcallResult<ResourceType> {
    tables
        .resource_types
        .get(name)
        .cloned()
        .ok_or_else(|| RollcallError::conflict(format!("resource type {name} is not registered")))
}

fn existing_id(tables: &Tables, key: &ResourceKey) -> RollcallResult<u64> {
    tables
        .resource_id(key)
        .ok_or_else(|| RollcallError::conflict(format!("resource {key} does not exist")))
}

fn ids_by_names(tables: &Tables, resource_type: &str, names: &BTreeSet<String>) -> BTreeMap<String, u64> {
    names
        .iter()
        .filter_map(|name| {
            let id = tables.resource_id(&ResourceKey::new(resource_type, name.as_str()))?;
            Some((name.clone(), id))
        })
        .collect()
}

/// Map every target name to its resource id, failing on the first unknown
fn resolve_targets<'t>(
    tables: &Tables,
    right_type: &str,
    targets: &'t AssociationTargets,
) -> RollcallResult<BTreeMap<u64, (ResourceKey, &'t Attributes)>> {
    targets
        .iter()
        .map(|(name, attributes)| {
            let key = ResourceKey::new(right_type, name.as_str());
            let id = existing_id(tables, &key)?;
            Ok((id, (key, attributes)))
        })
        .collect()
}

/// Bring the stored attributes of `owner_id` in line with `desired`.
///
/// Changed keys are deleted and re-inserted. Returns whether anything
/// changed.
fn sync_attributes(tables: &mut Tables, owner_id: u64, desired: &Attributes) -> bool {
    let stored = tables.attributes_of(owner_id);
    if &stored == desired {
        return false;
    }

    let ids = tables.attribute_ids_of(owner_id);
    for (key, value) in &stored {
        if desired.get(key) != Some(value) {
            if let Some(id) = ids.get(key) {
                tables.attributes.remove(id);
            }
        }
    }
    for (key, value) in desired {
        if stored.get(key) != Some(value) {
            tables.insert_attribute(owner_id, key, value);
        }
    }
    true
}

/// Insert or bump the resource row and diff its attributes
fn upsert_resource(tx: &mut Tx<'_>, resource: &Resource) -> (u64, Option<ChangeKind>) {
    let now = tx.now();
    let existing = match tx.tables.resource_id(&resource.key) {
        Some(id) => tx.tables.resources.get_mut(&id),
        None => None,
    };

    let (id, version) = match existing {
        Some(row) => {
            row.version += 1;
            row.modified_at = now;
            (row.id, row.version)
        }
        None => {
            let id = tx.tables.next_id();
            tx.tables.insert_resource(ResourceRow {
                id,
                key: resource.key.clone(),
                version: INITIAL_VERSION,
                created_at: now,
                modified_at: now,
            });
            (id, INITIAL_VERSION)
        }
    };

    let changed = sync_attributes(tx.tables, id, &resource.attributes);
    let kind = if version == INITIAL_VERSION {
        Some(ChangeKind::Created)
    } else if changed {
        Some(ChangeKind::Updated)
    } else {
        None
    };
    (id, kind)
}

fn insert_association(tx: &mut Tx<'_>, left_id: u64, right_id: u64, attributes: &Attributes) {
    let now = tx.now();
    let id = tx.tables.next_id();
    tx.tables.associations.insert(
        id,
        AssociationRow {
            id,
            left_id,
            right_id,
            created_at: now,
            modified_at: now,
        },
    );
    for (key, value) in attributes {
        tx.tables.insert_attribute(id, key, value);
    }
}

/// Diff the outgoing associations of `left_id` towards `right_type`.
///
/// Returns the right key and change kind of every edge that needs a record.
fn reconcile_associations(
    tx: &mut Tx<'_>,
    left_id: u64,
    right_type: &str,
    mut desired: BTreeMap<u64, (ResourceKey, &Attributes)>,
    resource_kind: Option<ChangeKind>,
) -> Vec<(ResourceKey, ChangeKind)> {
    let existing: Vec<(AssociationRow, ResourceKey)> = tx
        .tables
        .outgoing_associations(left_id)
        .into_iter()
        .filter_map(|row| {
            let right = tx.tables.key_of(row.right_id)?.clone();
            (right.resource_type == right_type).then_some((row, right))
        })
        .collect();

    let now = tx.now();
    let mut changes = Vec::new();
    for (row, right) in existing {
        match desired.remove(&row.right_id) {
            Some((_, attributes)) => {
                let changed = sync_attributes(tx.tables, row.id, attributes);
                if changed || resource_kind == Some(ChangeKind::Updated) {
                    if let Some(stored) = tx.tables.associations.get_mut(&row.id) {
                        stored.modified_at = now;
                    }
                    changes.push((right, ChangeKind::Updated));
                }
            }
            None => {
                tx.tables.remove_association(row.id);
                changes.push((right, ChangeKind::Deleted));
            }
        }
    }
    for (right_id, (right, attributes)) in desired {
        insert_association(tx, left_id, right_id, attributes);
        changes.push((right, ChangeKind::Created));
    }
    changes
}
