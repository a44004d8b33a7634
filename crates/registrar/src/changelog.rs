//! Sequence-numbered change records and the owner-died cascade.
//!
//! Each subject (a resource key, or a left/right key pair) owns exactly one
//! record. Writing to a subject again overwrites that record in place with
//! a freshly allocated sequence, so the log is always "latest state per
//! subject" and a reader catches up by scanning a sequence range.

use rollcall_common::{
    CallerContext, ChangeEvent, ChangeKind, ChangeRecord, ChangeSubject, ResourceKey,
    RollcallError, RollcallResult, Subscriber,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::store::{Gateway, Tables, Tx};

/// Whose subscriptions a change query is resolved against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every client connected through one of these servers
    Servers(BTreeSet<String>),
    /// A single (client, server) connection
    Client(CallerContext),
}

impl Audience {
    fn validate(&self) -> RollcallResult<()> {
        match self {
            Self::Servers(servers) => {
                if servers.is_empty() {
                    return Err(RollcallError::invalid("server addresses can not be empty"));
                }
                servers
                    .iter()
                    .try_for_each(|s| rollcall_common::error::require_text(s, "server address"))
            }
            Self::Client(ctx) => ctx.validate(),
        }
    }

    fn includes(&self, subscriber: &Subscriber) -> bool {
        match self {
            Self::Servers(servers) => servers.contains(&subscriber.server_address),
            Self::Client(ctx) => {
                subscriber.client_address == ctx.client_address
                    && subscriber.server_address == ctx.server_address
            }
        }
    }
}

pub struct ChangeLog<G> {
    gateway: Arc<G>,
}

impl<G: Gateway> ChangeLog<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    /// Write a record for `subject` owned by `ctx`; returns its sequence
    pub async fn record_change(
        &self,
        subject: ChangeSubject,
        kind: ChangeKind,
        ctx: &CallerContext,
    ) -> RollcallResult<u64> {
        ctx.validate()?;
        self.gateway
            .transaction(|tx| {
                let accepts_owner_died = accepts_owner_died(tx.tables, &subject)?;
                Ok(put_change(tx, subject, kind, ctx, accepts_owner_died))
            })
            .await
    }

    /// Cascade the death of one client connection.
    ///
    /// Returns the number of resource records moved to `OwnerDied`.
    #[allow(dead_code)]
    pub async fn on_client_died(&self, client: &str, server: &str) -> RollcallResult<usize> {
        let ctx = CallerContext::new(client, server);
        ctx.validate()?;
        self.gateway
            .transaction(|tx| {
                Ok(owner_died(tx, |record| {
                    record.is_owned_by(&ctx.client_address, &ctx.server_address)
                }))
            })
            .await
    }

    /// Cascade the death of whole servers (every client behind them)
    #[allow(dead_code)]
    pub async fn on_server_died(&self, servers: &BTreeSet<String>) -> RollcallResult<usize> {
        if servers.is_empty() {
            return Ok(0);
        }
        self.gateway
            .transaction(|tx| {
                Ok(owner_died(tx, |record| {
                    servers.contains(&record.server_address)
                }))
            })
            .await
    }

    /// Records with `from <= sequence <= to` visible to `audience`, one
    /// event per (subscriber, record), ordered by sequence
    pub async fn list_since(
        &self,
        from: u64,
        to: u64,
        audience: &Audience,
    ) -> RollcallResult<Vec<ChangeEvent>> {
        if to < from {
            return Err(RollcallError::invalid(format!(
                "sequence range is inverted: {from} > {to}"
            )));
        }
        audience.validate()?;
        self.gateway
            .read(|tables, _| Ok(visible_events(tables, from, to, audience)))
            .await
    }

    pub async fn current_sequence(&self) -> RollcallResult<u64> {
        self.gateway.current_sequence().await
    }
}

/// Owner-died eligibility is captured from the type at write time: a
/// resource's own type, or the left endpoint's type for an association.
pub(crate) fn accepts_owner_died(tables: &Tables, subject: &ChangeSubject) -> RollcallResult<bool> {
    let key = match subject {
        ChangeSubject::Resource { key } => key,
        ChangeSubject::Association { left, .. } => left,
    };
    tables
        .resource_types
        .get(&key.resource_type)
        .map(|t| t.is_online_resource)
        .ok_or_else(|| {
            RollcallError::conflict(format!("resource type {} is not registered", key.resource_type))
        })
}

/// Overwrite (or create) the record of `subject` inside an open transaction
pub(crate) fn put_change(
    tx: &mut Tx<'_>,
    subject: ChangeSubject,
    kind: ChangeKind,
    ctx: &CallerContext,
    accepts_owner_died: bool,
) -> u64 {
    let sequence = tx.next_sequence();
    let now = tx.now();

    let slot = match &subject {
        ChangeSubject::Resource { key } => tx.tables.resource_changes.get_mut(key),
        ChangeSubject::Association { left, right } => tx
            .tables
            .association_changes
            .get_mut(&(left.clone(), right.clone())),
    };
    if let Some(record) = slot {
        record.sequence = sequence;
        record.kind = kind;
        record.client_address = ctx.client_address.clone();
        record.server_address = ctx.server_address.clone();
        record.accepts_owner_died = accepts_owner_died;
        record.modified_at = now;
        return sequence;
    }

    let record = ChangeRecord {
        sequence,
        kind,
        subject: subject.clone(),
        client_address: ctx.client_address.clone(),
        server_address: ctx.server_address.clone(),
        accepts_owner_died,
        created_at: now,
        modified_at: now,
    };
    match subject {
        ChangeSubject::Resource { key } => {
            tx.tables.resource_changes.insert(key, record);
        }
        ChangeSubject::Association { left, right } => {
            tx.tables.association_changes.insert((left, right), record);
        }
    }
    sequence
}

/// Move an existing record to a terminal kind, keeping its owner
fn transition(tx: &mut Tx<'_>, record: &mut ChangeRecord, kind: ChangeKind) {
    record.sequence = tx.next_sequence();
    record.kind = kind;
    record.modified_at = tx.now();
}

/// Apply the owner-died cascade to every record `dying` selects.
///
/// 1. Eligible resource records go to `OwnerDied` and their resources are
///    removed.
/// 2. Every association touching a removed resource is removed too. Its
///    record becomes `OwnerDied` when it belongs to the dying party and is
///    eligible, `Deleted` otherwise.
/// 3. Eligible association records of the dying party go to `OwnerDied`
///    and their associations are removed.
///
/// Returns the number of resource records transitioned.
pub(crate) fn owner_died(tx: &mut Tx<'_>, dying: impl Fn(&ChangeRecord) -> bool) -> usize {
    let dead_keys: Vec<ResourceKey> = tx
        .tables
        .resource_changes
        .iter()
        .filter(|(_, record)| dying(record) && record.can_owner_die())
        .map(|(key, _)| key.clone())
        .collect();

    let mut dead_ids = BTreeSet::new();
    for key in &dead_keys {
        if let Some(mut record) = tx.tables.resource_changes.remove(key) {
            transition(tx, &mut record, ChangeKind::OwnerDied);
            tx.tables.resource_changes.insert(key.clone(), record);
        }
        if let Some(id) = tx.tables.resource_id(key) {
            dead_ids.insert(id);
        }
    }

    let mut edges: BTreeMap<u64, (ResourceKey, ResourceKey)> = BTreeMap::new();
    for id in tx.tables.association_ids_touching(&dead_ids) {
        if let Some(ends) = tx
            .tables
            .associations
            .get(&id)
            .and_then(|row| tx.tables.endpoints(row))
        {
            edges.insert(id, ends);
        }
    }
    let mut terminal = Vec::new();
    for (id, ends) in &edges {
        let kind = match tx.tables.association_changes.get(ends) {
            Some(record) if dying(record) && record.can_owner_die() => ChangeKind::OwnerDied,
            _ => ChangeKind::Deleted,
        };
        terminal.push((*id, ends.clone(), kind));
    }
    for (id, row) in &tx.tables.associations {
        if edges.contains_key(id) {
            continue;
        }
        let Some(ends) = tx.tables.endpoints(row) else {
            continue;
        };
        if let Some(record) = tx.tables.association_changes.get(&ends) {
            if dying(record) && record.can_owner_die() {
                terminal.push((*id, ends, ChangeKind::OwnerDied));
            }
        }
    }

    for (id, ends, kind) in terminal {
        tx.tables.remove_association(id);
        match tx.tables.association_changes.remove(&ends) {
            Some(mut record) => {
                transition(tx, &mut record, kind);
                tx.tables.association_changes.insert(ends, record);
            }
            None => {
                let subject = ChangeSubject::association(ends.0, ends.1);
                put_change(tx, subject, kind, &CallerContext::detached(), false);
            }
        }
    }

    for id in dead_ids {
        tx.tables.remove_resource(id);
    }

    dead_keys.len()
}

fn visible_events(tables: &Tables, from: u64, to: u64, audience: &Audience) -> Vec<ChangeEvent> {
    let mut watchers: BTreeMap<&ResourceKey, Vec<&Subscriber>> = BTreeMap::new();
    for subscriber in tables.subscribers.iter().filter(|s| audience.includes(s)) {
        watchers.entry(&subscriber.key).or_default().push(subscriber);
    }
    if watchers.is_empty() {
        return Vec::new();
    }

    let in_range = tables
        .resource_changes
        .values()
        .chain(tables.association_changes.values())
        .filter(|record| (from..=to).contains(&record.sequence));

    let mut seen = BTreeSet::new();
    let mut events = Vec::new();
    for record in in_range {
        for key in record.subject.watched_keys() {
            for subscriber in watchers.get(key).into_iter().flatten() {
                let marker = (
                    record.sequence,
                    subscriber.client_address.as_str(),
                    subscriber.server_address.as_str(),
                );
                if !seen.insert(marker) {
                    continue;
                }
                events.push(ChangeEvent {
                    subscriber: subscriber.client_address.clone(),
                    server_address: subscriber.server_address.clone(),
                    sequence: record.sequence,
                    kind: record.kind,
                    subject: record.subject.clone(),
                });
            }
        }
    }
    events.sort_by_key(|event| event.sequence);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AssociationTargets, ResourceGraph};
    use crate::store::MemoryGateway;
    use crate::subscriptions::SubscriptionRegistry;
    use rollcall_common::{Attributes, Resource, ResourceType};

    struct Fixture {
        gateway: Arc<MemoryGateway>,
        graph: ResourceGraph<MemoryGateway>,
        log: ChangeLog<MemoryGateway>,
        subscriptions: SubscriptionRegistry<MemoryGateway>,
    }

    async fn fixture() -> Fixture {
        let gateway = Arc::new(MemoryGateway::new());
        let graph = ResourceGraph::new(gateway.clone());
        graph
            .register_resource_type(&ResourceType::new("online").online())
            .await
            .unwrap();
        graph
            .register_resource_type(&ResourceType::new("static"))
            .await
            .unwrap();
        Fixture {
            log: ChangeLog::new(gateway.clone()),
            subscriptions: SubscriptionRegistry::new(gateway.clone()),
            graph,
            gateway,
        }
    }

    impl Fixture {
        async fn create(&self, resource_type: &str, name: &str, ctx: &CallerContext) {
            self.graph
                .add_or_update_resource(&Resource::new(resource_type, name), None, None, ctx)
                .await
                .unwrap();
        }

        async fn record(&self, key: &ResourceKey) -> Option<ChangeRecord> {
            self.gateway
                .read(|tables, _| Ok(tables.resource_changes.get(key).cloned()))
                .await
                .unwrap()
        }

        async fn edge(&self, left: &ResourceKey, right: &ResourceKey) -> Option<ChangeRecord> {
            self.gateway
                .read(|tables, _| {
                    Ok(tables
                        .association_changes
                        .get(&(left.clone(), right.clone()))
                        .cloned())
                })
                .await
                .unwrap()
        }
    }

    fn ctx(client: &str, server: &str) -> CallerContext {
        CallerContext::new(client, server)
    }

    #[tokio::test]
    async fn test_client_death_removes_online_resource() {
        let f = fixture().await;
        let owner = ctx("c1", "s1");
        f.create("online", "app1", &owner).await;
        let key = ResourceKey::new("online", "app1");
        assert_eq!(f.record(&key).await.unwrap().kind, ChangeKind::Created);

        assert_eq!(f.log.on_client_died("c1", "s1").await.unwrap(), 1);

        let record = f.record(&key).await.unwrap();
        assert_eq!(record.kind, ChangeKind::OwnerDied);
        assert_eq!(record.sequence, 2);
        assert!(f.graph.get_resource(&key).await.unwrap().is_none());

        // Repeat is a no-op
        assert_eq!(f.log.on_client_died("c1", "s1").await.unwrap(), 0);
        assert_eq!(f.log.current_sequence().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_static_resource_survives_owner_death() {
        let f = fixture().await;
        f.create("static", "cfg", &ctx("c1", "s1")).await;

        assert_eq!(f.log.on_client_died("c1", "s1").await.unwrap(), 0);

        let key = ResourceKey::new("static", "cfg");
        assert!(f.graph.get_resource(&key).await.unwrap().is_some());
        assert_eq!(f.record(&key).await.unwrap().kind, ChangeKind::Created);
    }

    #[tokio::test]
    async fn test_only_live_records_transition() {
        let f = fixture().await;
        let owner = ctx("c1", "s1");
        f.create("online", "app1", &owner).await;
        f.create("online", "app2", &owner).await;
        f.create("online", "app3", &owner).await;
        let names = BTreeSet::from(["app3".to_string()]);
        f.graph
            .remove_non_historic_resources_by_names("online", &names, &owner)
            .await
            .unwrap();

        assert_eq!(f.log.on_client_died("c1", "s1").await.unwrap(), 2);
        assert_eq!(
            f.record(&ResourceKey::new("online", "app3")).await.unwrap().kind,
            ChangeKind::Deleted
        );
        assert_eq!(f.log.on_client_died("c2", "s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cascade_reaches_associations() {
        let f = fixture().await;
        let service = ResourceKey::new("static", "service");
        let provider = ResourceKey::new("online", "service.email");
        f.create("static", "service", &ctx("C0", "S0")).await;

        let targets = AssociationTargets::from([("service".to_string(), Attributes::new())]);
        f.graph
            .add_or_update_resource(
                &Resource::new("online", "service.email"),
                Some("static"),
                Some(&targets),
                &ctx("C1", "S1"),
            )
            .await
            .unwrap();

        // The static resource's owner dying touches nothing
        f.log.on_client_died("C0", "S0").await.unwrap();
        assert!(f.graph.get_association(&provider, &service).await.unwrap().is_some());
        assert_eq!(f.edge(&provider, &service).await.unwrap().kind, ChangeKind::Created);

        assert_eq!(f.log.on_client_died("C1", "S1").await.unwrap(), 1);
        assert!(f.graph.get_resource(&provider).await.unwrap().is_none());
        assert!(f.graph.get_association(&provider, &service).await.unwrap().is_none());
        assert_eq!(f.edge(&provider, &service).await.unwrap().kind, ChangeKind::OwnerDied);
        assert!(f.graph.get_resource(&service).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_foreign_edges_to_dead_resource_are_deleted() {
        let f = fixture().await;
        let dying = ResourceKey::new("online", "worker");
        let other = ResourceKey::new("static", "queue");
        f.create("online", "worker", &ctx("c1", "s1")).await;
        f.create("static", "queue", &ctx("c2", "s2")).await;
        f.graph
            .add_or_update_association(&other, &dying, &Attributes::new(), &ctx("c2", "s2"))
            .await
            .unwrap();

        f.log.on_client_died("c1", "s1").await.unwrap();

        assert!(f.graph.get_association(&other, &dying).await.unwrap().is_none());
        assert_eq!(f.edge(&other, &dying).await.unwrap().kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn test_server_death_covers_all_its_clients() {
        let f = fixture().await;
        f.create("online", "a", &ctx("c1", "s1")).await;
        f.create("online", "b", &ctx("c2", "s1")).await;
        f.create("online", "c", &ctx("c3", "s2")).await;

        let servers = BTreeSet::from(["s1".to_string()]);
        assert_eq!(f.log.on_server_died(&servers).await.unwrap(), 2);
        assert!(f.graph.get_resource(&ResourceKey::new("online", "c")).await.unwrap().is_some());
        assert_eq!(f.log.on_server_died(&servers).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_change_overwrites_in_place() {
        let f = fixture().await;
        let key = ResourceKey::new("online", "app1");
        let subject = ChangeSubject::resource(key.clone());

        let first = f
            .log
            .record_change(subject.clone(), ChangeKind::Created, &ctx("c1", "s1"))
            .await
            .unwrap();
        let second = f
            .log
            .record_change(subject, ChangeKind::Updated, &ctx("c2", "s2"))
            .await
            .unwrap();

        assert!(second > first);
        let record = f.record(&key).await.unwrap();
        assert_eq!(record.sequence, second);
        assert!(record.is_owned_by("c2", "s2"));
        assert!(record.accepts_owner_died);
    }

    #[tokio::test]
    async fn test_list_since_respects_bounds() {
        let f = fixture().await;
        let watcher = ctx("w", "s1");
        for name in ["a", "b", "c", "d"] {
            f.create("static", name, &ctx("c1", "s1")).await;
            f.subscriptions
                .subscribe(&ResourceKey::new("static", name), &watcher)
                .await
                .unwrap();
        }

        let events = f.log.list_since(2, 3, &Audience::Client(watcher)).await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);

        assert!(matches!(
            f.log.list_since(3, 2, &Audience::Servers(BTreeSet::from(["s1".to_string()]))).await,
            Err(RollcallError::InvalidArgument(_))
        ));
        assert!(matches!(
            f.log.list_since(0, 2, &Audience::Servers(BTreeSet::new())).await,
            Err(RollcallError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_visibility_follows_current_subscriptions() {
        let f = fixture().await;
        let key = ResourceKey::new("static", "a");
        let watcher = ctx("w", "s1");
        f.create("static", "a", &ctx("c1", "s1")).await;
        let audience = Audience::Servers(BTreeSet::from(["s1".to_string()]));

        assert!(f.log.list_since(0, 10, &audience).await.unwrap().is_empty());

        f.subscriptions.subscribe(&key, &watcher).await.unwrap();
        let events = f.log.list_since(0, 10, &audience).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subscriber, "w");

        f.subscriptions.unsubscribe(&key, &watcher).await.unwrap();
        assert!(f.log.list_since(0, 10, &audience).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edge_seen_once_by_subscriber_of_both_ends() {
        let f = fixture().await;
        let left = ResourceKey::new("static", "l");
        let right = ResourceKey::new("static", "r");
        let watcher = ctx("w", "s1");
        f.create("static", "l", &watcher).await;
        f.create("static", "r", &watcher).await;
        f.subscriptions.subscribe(&left, &watcher).await.unwrap();
        f.subscriptions.subscribe(&right, &watcher).await.unwrap();
        let sequence = f
            .log
            .record_change(
                ChangeSubject::association(left.clone(), right.clone()),
                ChangeKind::Created,
                &watcher,
            )
            .await
            .unwrap();

        let events = f
            .log
            .list_since(sequence, sequence, &Audience::Client(watcher))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
