//! Leader timer.
//!
//! Runs on every server. Each tick renews this server's lease, discovers
//! the live servers, elects a leader when there is none, and, on the
//! leader only, reaps servers whose lease ran out. Membership changes are
//! forwarded to the transport.
//!
//! Removing a dead node, dropping its subscriptions and the owner-died
//! cascade commit as one transaction, so a failed reap leaves the node
//! listed for the next attempt.

use rollcall_common::{CallerContext, RollcallError, RollcallResult};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};

use super::registry::{self, NodeRegistry};
use crate::changelog;
use crate::store::Gateway;
use crate::subscriptions;
use crate::transport::{ConnectionEvent, ConnectionHub, Transport};

/// What this server last saw of the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterView {
    pub servers: BTreeSet<String>,
    pub masters: BTreeSet<String>,
}

pub struct LeaderTimer<G, T> {
    server: String,
    local: BTreeSet<String>,
    lease_secs: u64,
    gateway: Arc<G>,
    registry: NodeRegistry<G>,
    transport: Arc<T>,
    view: Mutex<ClusterView>,
    /// Clients whose close did not commit, retried every tick
    unfinished_closes: Mutex<BTreeSet<String>>,
}

impl<G: Gateway, T: Transport> LeaderTimer<G, T> {
    pub fn new(server: String, lease_secs: u64, gateway: Arc<G>, transport: Arc<T>) -> Self {
        Self {
            local: BTreeSet::from([server.clone()]),
            server,
            lease_secs,
            registry: NodeRegistry::new(gateway.clone()),
            gateway,
            transport,
            view: Mutex::new(ClusterView::default()),
            unfinished_closes: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub async fn view(&self) -> ClusterView {
        self.view.lock().await.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.view.lock().await.masters == self.local
    }

    /// Clear whatever a previous run under the same address left behind,
    /// then register
    pub async fn startup(&self) -> RollcallResult<()> {
        let stale = self.reap(&self.local).await?;
        if stale > 0 {
            tracing::warn!(server = %self.server, owner_died = stale, "Cleaned up a previous incarnation");
        }
        self.registry
            .register_servers(&self.local, self.lease_secs)
            .await?;
        tracing::info!(server = %self.server, lease_secs = self.lease_secs, "Server registered");
        Ok(())
    }

    /// Deregister this server and cascade its clients' deaths
    pub async fn shutdown(&self) -> RollcallResult<()> {
        let owner_died = self.reap(&self.local).await?;
        tracing::info!(server = %self.server, owner_died, "Server deregistered");
        Ok(())
    }

    pub async fn tick(&self) -> RollcallResult<()> {
        let renewed = self
            .registry
            .renew_lease(&self.local, self.lease_secs)
            .await?;
        if renewed < self.local.len() {
            tracing::error!(
                server = %self.server,
                renewed,
                "Lease lost, registering again and dropping all connections"
            );
            self.registry
                .register_servers(&self.local, self.lease_secs)
                .await?;
            self.transport.disconnect_all().await;
        }

        self.retry_unfinished_closes().await;

        let live = self.registry.list_live().await?;
        let servers: BTreeSet<String> = live.iter().map(|node| node.address.clone()).collect();
        let mut masters: BTreeSet<String> = live
            .iter()
            .filter(|node| node.is_master)
            .map(|node| node.address.clone())
            .collect();

        if masters.is_empty() {
            match self.registry.elect_leader(&self.local).await {
                Ok(()) => {
                    tracing::info!(server = %self.server, "👑 Elected leader");
                    masters = self.local.clone();
                }
                Err(RollcallError::DomainConflict(reason)) => {
                    tracing::warn!(server = %self.server, reason = %reason, "Lost leader election");
                    masters = self.registry.masters(&BTreeSet::new()).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if masters == self.local {
            let expired = self.registry.list_expired().await?;
            if !expired.is_empty() {
                let owner_died = self.reap(&expired).await?;
                tracing::info!(servers = ?expired, owner_died, "Reaped expired servers");
            }
        }

        let mut view = self.view.lock().await;
        if view.servers != servers || view.masters != masters {
            tracing::info!(servers = ?servers, masters = ?masters, "Cluster membership changed");
            self.transport.update_membership(&servers).await;
            *view = ClusterView { servers, masters };
        }
        Ok(())
    }

    /// A client connected through this server
    pub async fn on_connection_created(&self, client: &str) -> RollcallResult<()> {
        self.registry
            .register_child(client, &self.server, self.lease_secs)
            .await?;
        // A fresh connection supersedes a close still waiting for retry
        self.unfinished_closes.lock().await.remove(client);
        tracing::debug!(client = %client, "Client registered");
        Ok(())
    }

    /// A client connection closed: forget it and cascade its death.
    ///
    /// When the store refuses, the close is kept and retried on the next
    /// tick.
    pub async fn on_connection_closed(&self, client: &str) -> RollcallResult<()> {
        match self.close_client(client).await {
            Ok(owner_died) => {
                self.unfinished_closes.lock().await.remove(client);
                tracing::debug!(client = %client, owner_died, "Client disconnected");
                Ok(())
            }
            Err(e) => {
                self.unfinished_closes
                    .lock()
                    .await
                    .insert(client.to_string());
                Err(e)
            }
        }
    }

    async fn retry_unfinished_closes(&self) {
        let clients: Vec<String> = self.unfinished_closes.lock().await.iter().cloned().collect();
        for client in clients {
            if let Err(e) = self.on_connection_closed(&client).await {
                tracing::warn!(client = %client, error = %e, "Retried client close failed");
            }
        }
    }

    /// Remove one client row, its subscriptions and its owned records
    async fn close_client(&self, client: &str) -> RollcallResult<usize> {
        let ctx = CallerContext::new(client, self.server.as_str());
        ctx.validate()?;
        self.gateway
            .transaction(|tx| {
                registry::remove_child(tx, &ctx.client_address, &ctx.server_address);
                subscriptions::drop_where(tx.tables, |s| {
                    s.client_address == ctx.client_address && s.server_address == ctx.server_address
                });
                Ok(changelog::owner_died(tx, |record| {
                    record.is_owned_by(&ctx.client_address, &ctx.server_address)
                }))
            })
            .await
    }

    /// Remove servers with their children and subscriptions and drive the
    /// owner-died cascade for them
    async fn reap(&self, servers: &BTreeSet<String>) -> RollcallResult<usize> {
        if servers.is_empty() {
            return Ok(0);
        }
        self.gateway
            .transaction(|tx| {
                registry::remove_with_children(tx, servers);
                subscriptions::drop_where(tx.tables, |s| servers.contains(&s.server_address));
                Ok(changelog::owner_died(tx, |record| {
                    servers.contains(&record.server_address)
                }))
            })
            .await
    }

    /// Tick on a fixed period until shutdown
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(server = %self.server, period = ?period, "⏱️ Leader timer started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Leader tick failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Leader timer shutting down");
                    break;
                }
            }
        }
    }
}

/// Forward hub lifecycle events to the leader timer
pub async fn connection_worker<G: Gateway>(
    leader: Arc<LeaderTimer<G, ConnectionHub>>,
    hub: Arc<ConnectionHub>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let result = match event {
                    Some(ConnectionEvent::Opened { address }) => {
                        leader.on_connection_created(&address).await
                    }
                    Some(ConnectionEvent::Closed { address, connection_id }) => {
                        if hub.detach(&address, connection_id).await {
                            leader.on_connection_closed(&address).await
                        } else {
                            Ok(())
                        }
                    }
                    None => break,
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to apply connection event");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
