//! Change dispatcher.
//!
//! Polls the shared sequence counter and pushes every new change visible
//! to a client connected through this server. Delivery is at-least-once:
//! a recipient whose push fails or times out is replayed from the lowest
//! sequence it missed on the next tick.

use rollcall_common::{CallerContext, ChangeEvent, RollcallResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::cache::ResourceCache;
use crate::changelog::{Audience, ChangeLog};
use crate::store::Gateway;
use crate::transport::{PushOutcome, Transport};

/// (client address, server address)
type Recipient = (String, String);

/// Dispatcher configuration
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Addresses this server registers under
    pub servers: BTreeSet<String>,
    /// Pause between ticks
    pub period: Duration,
    /// Upper bound for a single push
    pub push_timeout: Duration,
}

/// Outcome of one tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub not_connected: usize,
    pub failed: usize,
}

pub struct ChangeDispatcher<G, T> {
    config: DispatcherConfig,
    changes: ChangeLog<G>,
    transport: Arc<T>,
    cache: Arc<ResourceCache>,
    last_seen: u64,
    /// Recipients owed a replay, with the lowest sequence they missed
    pending: BTreeMap<Recipient, u64>,
}

impl<G: Gateway, T: Transport> ChangeDispatcher<G, T> {
    /// Start from the current sequence; older changes are not pushed
    pub async fn new(
        config: DispatcherConfig,
        gateway: Arc<G>,
        transport: Arc<T>,
        cache: Arc<ResourceCache>,
    ) -> RollcallResult<Self> {
        let changes = ChangeLog::new(gateway);
        let last_seen = changes.current_sequence().await?;
        tracing::debug!(last_seen, "Change dispatcher positioned");

        Ok(Self {
            config,
            changes,
            transport,
            cache,
            last_seen,
            pending: BTreeMap::new(),
        })
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Recipients waiting for a replay
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Push everything committed since the last tick
    pub async fn tick(&mut self) -> RollcallResult<DispatchReport> {
        let current = self.changes.current_sequence().await?;
        if current <= self.last_seen && self.pending.is_empty() {
            return Ok(DispatchReport::default());
        }

        let mut batches: BTreeMap<Recipient, Vec<ChangeEvent>> = BTreeMap::new();
        if current > self.last_seen {
            let audience = Audience::Servers(self.config.servers.clone());
            let fresh = self
                .changes
                .list_since(self.last_seen + 1, current, &audience)
                .await?;
            for event in fresh {
                self.cache.evict_subject(&event.subject);
                batches
                    .entry((event.subscriber.clone(), event.server_address.clone()))
                    .or_default()
                    .push(event);
            }
        }

        // A replay covers everything the fresh range would have sent
        for ((client, server), from) in &self.pending {
            let audience = Audience::Client(CallerContext::new(client.as_str(), server.as_str()));
            let replay = self
                .changes
                .list_since(*from, current.max(*from), &audience)
                .await?;
            batches.insert((client.clone(), server.clone()), replay);
        }

        self.last_seen = self.last_seen.max(current);
        self.pending.clear();

        let mut report = DispatchReport::default();
        for ((client, server), events) in batches {
            let Some(first) = events.first().map(|e| e.sequence) else {
                continue;
            };
            let push = self.transport.push(&client, &events);
            let outcome = tokio::time::timeout(self.config.push_timeout, push).await;
            match outcome {
                Ok(Ok(PushOutcome::Delivered)) => {
                    report.delivered += 1;
                    tracing::trace!(client = %client, events = events.len(), "Changes pushed");
                }
                Ok(Ok(PushOutcome::NotConnected)) => {
                    report.not_connected += 1;
                    tracing::debug!(client = %client, "Subscriber not connected, skipping");
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(client = %client, error = %e, "Push failed, will replay");
                    self.pending.insert((client, server), first);
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::warn!(
                        client = %client,
                        timeout = ?self.config.push_timeout,
                        "Push timed out, will replay"
                    );
                    self.pending.insert((client, server), first);
                }
            }
        }

        Ok(report)
    }

    /// Tick on a fixed period until shutdown. A tick in flight always
    /// completes before the loop exits.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            servers = ?self.config.servers,
            period = ?self.config.period,
            "📬 Change dispatcher started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.period) => {
                    match self.tick().await {
                        Ok(report) if report != DispatchReport::default() => {
                            tracing::debug!(
                                last_seen = self.last_seen,
                                delivered = report.delivered,
                                not_connected = report.not_connected,
                                failed = report.failed,
                                "Dispatch tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Dispatch tick failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Change dispatcher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceGraph;
    use crate::store::MemoryGateway;
    use crate::subscriptions::SubscriptionRegistry;
    use crate::transport::testing::RecordingTransport;
    use rollcall_common::{Resource, ResourceKey, ResourceType};

    const SERVER: &str = "10.0.0.1:7070";

    struct Fixture {
        gateway: Arc<MemoryGateway>,
        graph: ResourceGraph<MemoryGateway>,
        subscriptions: SubscriptionRegistry<MemoryGateway>,
        transport: Arc<RecordingTransport>,
        cache: Arc<ResourceCache>,
    }

    async fn fixture() -> Fixture {
        let gateway = Arc::new(MemoryGateway::new());
        let graph = ResourceGraph::new(gateway.clone());
        graph
            .register_resource_type(&ResourceType::new("svc"))
            .await
            .unwrap();
        Fixture {
            subscriptions: SubscriptionRegistry::new(gateway.clone()),
            transport: Arc::new(RecordingTransport::default()),
            cache: Arc::new(ResourceCache::new(64)),
            graph,
            gateway,
        }
    }

    impl Fixture {
        async fn dispatcher(&self) -> ChangeDispatcher<MemoryGateway, RecordingTransport> {
            let config = DispatcherConfig {
                servers: BTreeSet::from([SERVER.to_string()]),
                period: Duration::from_millis(10),
                push_timeout: Duration::from_millis(200),
            };
            ChangeDispatcher::new(
                config,
                self.gateway.clone(),
                self.transport.clone(),
                self.cache.clone(),
            )
            .await
            .unwrap()
        }

        async fn write(&self, name: &str, version: &str) {
            let resource = Resource::new("svc", name).with_attribute("v", version);
            let writer = CallerContext::new("writer", SERVER);
            self.graph
                .add_or_update_resource(&resource, None, None, &writer)
                .await
                .unwrap();
        }

        async fn watch(&self, client: &str, name: &str) {
            self.subscriptions
                .subscribe(&ResourceKey::new("svc", name), &CallerContext::new(client, SERVER))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_one_push_per_subscriber() {
        let f = fixture().await;
        for name in ["a", "b", "c", "d", "e"] {
            f.write(name, "1").await;
        }
        f.watch("X", "r7").await;
        f.watch("X", "r8").await;

        let mut dispatcher = f.dispatcher().await;
        assert_eq!(dispatcher.last_seen(), 5);

        f.write("r6", "1").await;
        f.write("r7", "1").await;
        f.write("r8", "1").await;
        let report = dispatcher.tick().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(f.transport.pushes(), vec![("X".to_string(), vec![7, 8])]);
        assert_eq!(dispatcher.last_seen(), 8);
    }

    #[tokio::test]
    async fn test_idle_tick_pushes_nothing() {
        let f = fixture().await;
        f.watch("X", "a").await;
        f.write("a", "1").await;

        let mut dispatcher = f.dispatcher().await;
        dispatcher.tick().await.unwrap();

        assert!(f.transport.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_recipient_is_replayed() {
        let f = fixture().await;
        f.watch("X", "a").await;
        f.watch("Y", "a").await;
        let mut dispatcher = f.dispatcher().await;

        f.transport.fail_for("X", true);
        f.write("a", "1").await;
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(dispatcher.pending(), 1);

        f.transport.fail_for("X", false);
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(
            f.transport.pushes(),
            vec![("Y".to_string(), vec![1]), ("X".to_string(), vec![1])]
        );
    }

    #[tokio::test]
    async fn test_stalled_recipient_times_out_and_is_replayed() {
        let f = fixture().await;
        f.watch("X", "a").await;
        f.watch("Y", "a").await;
        let mut dispatcher = f.dispatcher().await;

        f.transport.stall_for("X", true);
        f.write("a", "1").await;
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(dispatcher.pending(), 1);
        assert_eq!(f.transport.pushes(), vec![("Y".to_string(), vec![1])]);

        f.transport.stall_for("X", false);
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(
            f.transport.pushes(),
            vec![("Y".to_string(), vec![1]), ("X".to_string(), vec![1])]
        );
    }

    #[tokio::test]
    async fn test_absent_recipient_is_not_retried() {
        let f = fixture().await;
        f.watch("gone", "a").await;
        let mut dispatcher = f.dispatcher().await;
        f.transport.absent.lock().unwrap().insert("gone".to_string());

        f.write("a", "1").await;
        let report = dispatcher.tick().await.unwrap();

        assert_eq!(report.not_connected, 1);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_touched_keys_leave_the_cache() {
        let f = fixture().await;
        f.watch("X", "a").await;
        f.write("a", "1").await;
        let mut dispatcher = f.dispatcher().await;
        f.cache.put(Resource::new("svc", "a"));

        f.write("a", "2").await;
        dispatcher.tick().await.unwrap();

        assert!(f.cache.get(&ResourceKey::new("svc", "a")).is_none());
    }
}
