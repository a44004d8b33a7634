//! Which connection watches which resource.

use rollcall_common::{CallerContext, ResourceKey, RollcallResult, Subscriber};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::store::{Gateway, Tables};

pub struct SubscriptionRegistry<G> {
    gateway: Arc<G>,
}

impl<G: Gateway> SubscriptionRegistry<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    /// Watch `key` from `ctx`; returns false when already subscribed
    pub async fn subscribe(&self, key: &ResourceKey, ctx: &CallerContext) -> RollcallResult<bool> {
        key.validate()?;
        ctx.validate()?;
        self.gateway
            .transaction(|tx| Ok(tx.tables.subscribers.insert(subscriber(key, ctx))))
            .await
    }

    pub async fn unsubscribe(&self, key: &ResourceKey, ctx: &CallerContext) -> RollcallResult<bool> {
        key.validate()?;
        ctx.validate()?;
        self.gateway
            .transaction(|tx| Ok(tx.tables.subscribers.remove(&subscriber(key, ctx))))
            .await
    }

    /// Drop every subscription of one connection
    #[allow(dead_code)]
    pub async fn unsubscribe_client(&self, ctx: &CallerContext) -> RollcallResult<usize> {
        ctx.validate()?;
        self.gateway
            .transaction(|tx| {
                Ok(drop_where(tx.tables, |s| {
                    s.client_address == ctx.client_address && s.server_address == ctx.server_address
                }))
            })
            .await
    }

    /// Drop every subscription held through these servers
    #[allow(dead_code)]
    pub async fn unsubscribe_servers(&self, servers: &BTreeSet<String>) -> RollcallResult<usize> {
        if servers.is_empty() {
            return Ok(0);
        }
        self.gateway
            .transaction(|tx| Ok(drop_where(tx.tables, |s| servers.contains(&s.server_address))))
            .await
    }

    pub async fn list_subscriptions(&self, ctx: &CallerContext) -> RollcallResult<Vec<ResourceKey>> {
        ctx.validate()?;
        self.gateway
            .read(|tables, _| {
                Ok(tables
                    .subscribers
                    .iter()
                    .filter(|s| {
                        s.client_address == ctx.client_address
                            && s.server_address == ctx.server_address
                    })
                    .map(|s| s.key.clone())
                    .collect())
            })
            .await
    }
}

fn subscriber(key: &ResourceKey, ctx: &CallerContext) -> Subscriber {
    Subscriber {
        key: key.clone(),
        client_address: ctx.client_address.clone(),
        server_address: ctx.server_address.clone(),
    }
}

pub(crate) fn drop_where(tables: &mut Tables, doomed: impl Fn(&Subscriber) -> bool) -> usize {
    let before = tables.subscribers.len();
    tables.subscribers.retain(|s| !doomed(s));
    before - tables.subscribers.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGateway;

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new(Arc::new(MemoryGateway::new()));
        let key = ResourceKey::new("svc", "app1");
        let ctx = CallerContext::new("c1", "s1");

        assert!(registry.subscribe(&key, &ctx).await.unwrap());
        assert!(!registry.subscribe(&key, &ctx).await.unwrap());
        assert_eq!(registry.list_subscriptions(&ctx).await.unwrap(), vec![key.clone()]);

        assert!(registry.unsubscribe(&key, &ctx).await.unwrap());
        assert!(registry.list_subscriptions(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_unsubscribe() {
        let registry = SubscriptionRegistry::new(Arc::new(MemoryGateway::new()));
        let c1 = CallerContext::new("c1", "s1");
        let c2 = CallerContext::new("c2", "s1");
        let c3 = CallerContext::new("c3", "s2");
        for ctx in [&c1, &c2, &c3] {
            registry.subscribe(&ResourceKey::new("svc", "a"), ctx).await.unwrap();
            registry.subscribe(&ResourceKey::new("svc", "b"), ctx).await.unwrap();
        }

        assert_eq!(registry.unsubscribe_client(&c1).await.unwrap(), 2);
        let servers = BTreeSet::from(["s1".to_string()]);
        assert_eq!(registry.unsubscribe_servers(&servers).await.unwrap(), 2);
        assert_eq!(registry.list_subscriptions(&c3).await.unwrap().len(), 2);
    }
}
