//! Caller-scoped resource operations exposed to clients.

use rollcall_common::{
    Association, Attributes, CallerContext, ChangeEvent, Resource, ResourceKey, ResourceType,
    RollcallError, RollcallResult,
};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::ResourceCache;
use crate::changelog::{Audience, ChangeLog};
use crate::graph::{AssociationTargets, ResourceGraph};
use crate::store::Gateway;
use crate::subscriptions::SubscriptionRegistry;

pub struct ResourceAccess<G> {
    graph: ResourceGraph<G>,
    subscriptions: SubscriptionRegistry<G>,
    changes: ChangeLog<G>,
    cache: Arc<ResourceCache>,
}

impl<G: Gateway> ResourceAccess<G> {
    pub fn new(gateway: Arc<G>, cache: Arc<ResourceCache>) -> Self {
        Self {
            graph: ResourceGraph::new(gateway.clone()),
            subscriptions: SubscriptionRegistry::new(gateway.clone()),
            changes: ChangeLog::new(gateway),
            cache,
        }
    }

    pub async fn register_resource_type(&self, resource_type: &ResourceType) -> RollcallResult<bool> {
        let created = self.graph.register_resource_type(resource_type).await?;
        if created {
            tracing::info!(
                resource_type = %resource_type.name,
                online = resource_type.is_online_resource,
                historic = resource_type.keep_historic,
                "Resource type registered"
            );
        }
        Ok(created)
    }

    /// Write a resource; the writer is subscribed to it as well
    pub async fn add_or_update_resource(
        &self,
        resource: &Resource,
        right_type: Option<&str>,
        targets: Option<&AssociationTargets>,
        ctx: &CallerContext,
    ) -> RollcallResult<Resource> {
        self.subscriptions.subscribe(&resource.key, ctx).await?;
        let stored = self
            .graph
            .add_or_update_resource(resource, right_type, targets, ctx)
            .await?;
        self.cache.evict(&stored.key);
        Ok(stored)
    }

    /// Subscribe and return the current state of the resource
    pub async fn subscribe(
        &self,
        key: &ResourceKey,
        ctx: &CallerContext,
    ) -> RollcallResult<Option<Resource>> {
        self.subscriptions.subscribe(key, ctx).await?;
        self.get_resource(key).await
    }

    pub async fn subscribe_all(
        &self,
        keys: &BTreeSet<ResourceKey>,
        ctx: &CallerContext,
    ) -> RollcallResult<usize> {
        if keys.is_empty() {
            return Err(RollcallError::invalid("keys can not be empty"));
        }
        for key in keys {
            key.validate()?;
        }
        let mut added = 0;
        for key in keys {
            if self.subscriptions.subscribe(key, ctx).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub async fn unsubscribe(&self, key: &ResourceKey, ctx: &CallerContext) -> RollcallResult<bool> {
        self.subscriptions.unsubscribe(key, ctx).await
    }

    /// Read-through the snapshot cache
    pub async fn get_resource(&self, key: &ResourceKey) -> RollcallResult<Option<Resource>> {
        key.validate()?;
        if let Some(resource) = self.cache.get(key) {
            return Ok(Some(resource));
        }
        let resource = self.graph.get_resource(key).await?;
        if let Some(resource) = &resource {
            self.cache.put(resource.clone());
        }
        Ok(resource)
    }

    pub async fn remove_resource(&self, key: &ResourceKey, ctx: &CallerContext) -> RollcallResult<bool> {
        key.validate()?;
        let names = BTreeSet::from([key.name.clone()]);
        let removed = self
            .graph
            .remove_non_historic_resources_by_names(&key.resource_type, &names, ctx)
            .await?;
        self.cache.evict(key);
        Ok(removed > 0)
    }

    pub async fn add_or_update_association(
        &self,
        left: &ResourceKey,
        right: &ResourceKey,
        attributes: &Attributes,
        ctx: &CallerContext,
    ) -> RollcallResult<Association> {
        self.graph
            .add_or_update_association(left, right, attributes, ctx)
            .await
    }

    pub async fn remove_association(
        &self,
        left: &ResourceKey,
        right: &ResourceKey,
        ctx: &CallerContext,
    ) -> RollcallResult<bool> {
        self.graph.remove_association(left, right, ctx).await
    }

    pub async fn get_association(
        &self,
        left: &ResourceKey,
        right: &ResourceKey,
    ) -> RollcallResult<Option<Association>> {
        self.graph.get_association(left, right).await
    }

    /// Everything after `since` visible to this connection, for clients
    /// catching up after a reconnect
    pub async fn lost_events(&self, since: u64, ctx: &CallerContext) -> RollcallResult<Vec<ChangeEvent>> {
        ctx.validate()?;
        let current = self.changes.current_sequence().await?;
        if since >= current {
            return Ok(Vec::new());
        }
        self.changes
            .list_since(since + 1, current, &Audience::Client(ctx.clone()))
            .await
    }

    pub async fn current_sequence(&self) -> RollcallResult<u64> {
        self.changes.current_sequence().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGateway;

    async fn access() -> ResourceAccess<MemoryGateway> {
        let access = ResourceAccess::new(
            Arc::new(MemoryGateway::new()),
            Arc::new(ResourceCache::new(64)),
        );
        access
            .register_resource_type(&ResourceType::new("svc"))
            .await
            .unwrap();
        access
    }

    #[tokio::test]
    async fn test_writer_sees_its_own_changes() {
        let access = access().await;
        let ctx = CallerContext::new("c1", "s1");
        access
            .add_or_update_resource(&Resource::new("svc", "a"), None, None, &ctx)
            .await
            .unwrap();

        let events = access.lost_events(0, &ctx).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(access.lost_events(1, &ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cached_read_is_refreshed_by_local_write() {
        let access = access().await;
        let ctx = CallerContext::new("c1", "s1");
        let key = ResourceKey::new("svc", "a");
        access
            .add_or_update_resource(&Resource::new("svc", "a").with_attribute("v", "1"), None, None, &ctx)
            .await
            .unwrap();
        assert_eq!(access.get_resource(&key).await.unwrap().unwrap().attributes["v"], "1");

        access
            .add_or_update_resource(&Resource::new("svc", "a").with_attribute("v", "2"), None, None, &ctx)
            .await
            .unwrap();
        assert_eq!(access.get_resource(&key).await.unwrap().unwrap().attributes["v"], "2");

        assert!(access.remove_resource(&key, &ctx).await.unwrap());
        assert!(access.get_resource(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_all_rejects_empty() {
        let access = access().await;
        let ctx = CallerContext::new("c1", "s1");
        assert!(access.subscribe_all(&BTreeSet::new(), &ctx).await.is_err());

        let keys = BTreeSet::from([ResourceKey::new("svc", "a"), ResourceKey::new("svc", "b")]);
        assert_eq!(access.subscribe_all(&keys, &ctx).await.unwrap(), 2);
        assert!(access.subscribe(&ResourceKey::new("svc", "a"), &ctx).await.unwrap().is_none());
    }
}
