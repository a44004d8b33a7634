//! Node liveness and leader election.
//!
//! Servers are parentless nodes; clients are children of the server they
//! are connected through. A node is live while its lease (`expires_at`)
//! lies in the future of the gateway's shared clock.

use chrono::{DateTime, TimeDelta, Utc};
use rollcall_common::constants::NO_PARENT_ADDRESS;
use rollcall_common::error::require_text;
use rollcall_common::{NodeRecord, RollcallError, RollcallResult};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::store::{Gateway, Tables, Tx};

/// Liveness registry for servers and their connected clients
pub struct NodeRegistry<G> {
    gateway: Arc<G>,
}

impl<G: Gateway> NodeRegistry<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    /// Upsert every address as a top-level server
    pub async fn register_servers(
        &self,
        addresses: &BTreeSet<String>,
        lease_secs: u64,
    ) -> RollcallResult<()> {
        for address in addresses {
            require_text(address, "server address")?;
        }
        self.gateway
            .transaction(|tx| {
                for address in addresses {
                    upsert_node(tx, address, NO_PARENT_ADDRESS, lease_secs)?;
                }
                Ok(())
            })
            .await
    }

    /// Upsert a client as a child of `server`
    pub async fn register_child(
        &self,
        client: &str,
        server: &str,
        lease_secs: u64,
    ) -> RollcallResult<()> {
        require_text(client, "client address")?;
        require_text(server, "server address")?;
        self.gateway
            .transaction(|tx| upsert_node(tx, client, server, lease_secs))
            .await
    }

    /// Remove one child row; returns the number of rows removed
    #[allow(dead_code)]
    pub async fn unregister_child(&self, client: &str, server: &str) -> RollcallResult<usize> {
        require_text(client, "client address")?;
        require_text(server, "server address")?;
        self.gateway
            .transaction(|tx| Ok(remove_child(tx, client, server)))
            .await
    }

    /// Extend the lease of parentless nodes without touching `modified_at`.
    ///
    /// Returns how many rows were renewed; fewer than `addresses.len()`
    /// means someone else removed us.
    pub async fn renew_lease(
        &self,
        addresses: &BTreeSet<String>,
        lease_secs: u64,
    ) -> RollcallResult<usize> {
        self.gateway
            .transaction(|tx| {
                let expires_at = expiry(tx.now(), lease_secs)?;
                let mut renewed = 0;
                for address in addresses {
                    let key = (address.clone(), NO_PARENT_ADDRESS.to_string());
                    if let Some(node) = tx.tables.nodes.get_mut(&key) {
                        node.expires_at = expires_at;
                        renewed += 1;
                    }
                }
                Ok(renewed)
            })
            .await
    }

    /// Flag `candidates` as master.
    ///
    /// Expired masters are demoted first. The candidates are then flagged and
    /// the master set re-read: if any other live server still holds the
    /// flag, the whole write is rolled back with `DomainConflict`.
    pub async fn elect_leader(&self, candidates: &BTreeSet<String>) -> RollcallResult<()> {
        if candidates.is_empty() {
            return Err(RollcallError::invalid("leader candidates can not be empty"));
        }
        self.gateway
            .transaction(|tx| {
                let now = tx.now();
                for node in tx.tables.nodes.values_mut() {
                    if node.is_parent() && node.is_master && !node.is_live(now) {
                        node.is_master = false;
                    }
                }
                for node in tx.tables.nodes.values_mut() {
                    if node.is_parent() && candidates.contains(&node.address) {
                        node.is_master = true;
                    }
                }

                let rivals = live_masters(tx.tables, now, candidates);
                if !rivals.is_empty() {
                    return Err(RollcallError::conflict(format!(
                        "master already registered: {rivals:?}"
                    )));
                }
                Ok(())
            })
            .await
    }

    /// Live masters other than `excluding`
    pub async fn masters(&self, excluding: &BTreeSet<String>) -> RollcallResult<BTreeSet<String>> {
        self.gateway
            .read(|tables, now| Ok(live_masters(tables, now, excluding)))
            .await
    }

    /// Live parentless nodes
    pub async fn list_live(&self) -> RollcallResult<Vec<NodeRecord>> {
        self.gateway
            .read(|tables, now| {
                Ok(tables
                    .nodes
                    .values()
                    .filter(|node| node.is_parent() && node.is_live(now))
                    .cloned()
                    .collect())
            })
            .await
    }

    /// Addresses of expired parentless nodes
    pub async fn list_expired(&self) -> RollcallResult<BTreeSet<String>> {
        self.gateway
            .read(|tables, now| {
                Ok(tables
                    .nodes
                    .values()
                    .filter(|node| node.is_parent() && !node.is_live(now))
                    .map(|node| node.address.clone())
                    .collect())
            })
            .await
    }

    /// Clients registered under `parent`
    pub async fn list_children(&self, parent: &str) -> RollcallResult<Vec<NodeRecord>> {
        require_text(parent, "parent address")?;
        self.gateway
            .read(|tables, _| {
                Ok(tables
                    .nodes
                    .values()
                    .filter(|node| node.parent_address == parent)
                    .cloned()
                    .collect())
            })
            .await
    }

    /// Remove servers and every child registered under them
    #[allow(dead_code)]
    pub async fn remove_with_children(&self, addresses: &BTreeSet<String>) -> RollcallResult<usize> {
        if addresses.is_empty() {
            return Ok(0);
        }
        self.gateway
            .transaction(|tx| Ok(remove_with_children(tx, addresses)))
            .await
    }
}

/// Lease end for a lease starting at `now`
fn expiry(now: DateTime<Utc>, lease_secs: u64) -> RollcallResult<DateTime<Utc>> {
    i64::try_from(lease_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|lease| now.checked_add_signed(lease))
        .ok_or_else(|| RollcallError::invalid(format!("lease of {lease_secs}s is out of range")))
}

fn upsert_node(tx: &mut Tx<'_>, address: &str, parent: &str, lease_secs: u64) -> RollcallResult<()> {
    let now = tx.now();
    let expires_at = expiry(now, lease_secs)?;
    tx.tables
        .nodes
        .entry((address.to_string(), parent.to_string()))
        .and_modify(|node| {
            node.modified_at = now;
            node.expires_at = expires_at;
        })
        .or_insert_with(|| NodeRecord {
            address: address.to_string(),
            parent_address: parent.to_string(),
            is_master: false,
            created_at: now,
            modified_at: now,
            expires_at,
        });
    Ok(())
}

fn live_masters(
    tables: &Tables,
    now: DateTime<Utc>,
    excluding: &BTreeSet<String>,
) -> BTreeSet<String> {
    tables
        .nodes
        .values()
        .filter(|node| node.is_parent() && node.is_master && node.is_live(now))
        .filter(|node| !excluding.contains(&node.address))
        .map(|node| node.address.clone())
        .collect()
}

/// Drop one client row inside an open transaction
pub(crate) fn remove_child(tx: &mut Tx<'_>, client: &str, server: &str) -> usize {
    let removed = tx
        .tables
        .nodes
        .remove(&(client.to_string(), server.to_string()));
    usize::from(removed.is_some())
}

/// Drop server rows and their children inside an open transaction
pub(crate) fn remove_with_children(tx: &mut Tx<'_>, addresses: &BTreeSet<String>) -> usize {
    let before = tx.tables.nodes.len();
    tx.tables.nodes.retain(|(address, parent), _| {
        let is_server = parent == NO_PARENT_ADDRESS && addresses.contains(address);
        !is_server && !addresses.contains(parent)
    });
    before - tx.tables.nodes.len()
}
