//! Core types shared across Rollcall components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::{INITIAL_VERSION, NO_CLIENT_ADDRESS, NO_PARENT_ADDRESS, NO_SERVER_ADDRESS};
use crate::error::{RollcallResult, require_text};

/// Attribute map of a resource or association (key -> value)
pub type Attributes = BTreeMap<String, String>;

/// A registered kind of resource.
///
/// - `is_online_resource`: instances are cascaded away when the connection
///   that wrote them dies
/// - `keep_historic`: instances can never be explicitly deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    #[serde(default)]
    pub is_online_resource: bool,
    #[serde(default)]
    pub keep_historic: bool,
}

impl ResourceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_online_resource: false,
            keep_historic: false,
        }
    }

    pub fn online(mut self) -> Self {
        self.is_online_resource = true;
        self
    }

    pub fn historic(mut self) -> Self {
        self.keep_historic = true;
        self
    }
}

/// Stable external key of a resource: (type, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    pub fn validate(&self) -> RollcallResult<()> {
        require_text(&self.resource_type, "resource type")?;
        require_text(&self.name, "resource name")
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.name)
    }
}

/// A typed, named resource with its attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Surrogate id (0 until persisted)
    #[serde(default)]
    pub id: u64,
    pub key: ResourceKey,
    /// Bumped on every upsert; `INITIAL_VERSION` on creation
    #[serde(default = "initial_version")]
    pub version: u64,
    #[serde(default)]
    pub attributes: Attributes,
}

fn initial_version() -> u64 {
    INITIAL_VERSION
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: 0,
            key: ResourceKey::new(resource_type, name),
            version: INITIAL_VERSION,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A directed edge between two resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub id: u64,
    pub left: ResourceKey,
    pub right: ResourceKey,
    pub left_id: u64,
    pub right_id: u64,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Kind of mutation described by a change record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    OwnerDied,
}

impl ChangeKind {
    /// Only live (created/updated) records may become `OwnerDied`
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Deleted => "DELETED",
            Self::OwnerDied => "OWNER_DIED",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a change record is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSubject {
    Resource { key: ResourceKey },
    Association { left: ResourceKey, right: ResourceKey },
}

impl ChangeSubject {
    pub fn resource(key: ResourceKey) -> Self {
        Self::Resource { key }
    }

    pub fn association(left: ResourceKey, right: ResourceKey) -> Self {
        Self::Association { left, right }
    }

    /// Resource keys whose subscribers see this subject
    pub fn watched_keys(&self) -> Vec<&ResourceKey> {
        match self {
            Self::Resource { key } => vec![key],
            Self::Association { left, right } => vec![left, right],
        }
    }
}

/// One durable, sequence-numbered record of a mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sequence: u64,
    pub kind: ChangeKind,
    pub subject: ChangeSubject,
    pub client_address: String,
    pub server_address: String,
    /// Captured from the subject's type at write time, never re-checked
    pub accepts_owner_died: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Eligible for the owner-died transition
    pub fn can_owner_die(&self) -> bool {
        self.accepts_owner_died && self.kind.is_live()
    }

    pub fn is_owned_by(&self, client_address: &str, server_address: &str) -> bool {
        self.client_address == client_address && self.server_address == server_address
    }
}

/// A change record as delivered to one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Subscribing client's address
    pub subscriber: String,
    /// Server the subscriber is connected through
    pub server_address: String,
    pub sequence: u64,
    pub kind: ChangeKind,
    pub subject: ChangeSubject,
}

/// "This client, via this server, watches this resource"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscriber {
    pub key: ResourceKey,
    pub client_address: String,
    pub server_address: String,
}

/// Liveness record of a server (parentless) or client (child) node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub address: String,
    /// `NO_PARENT_ADDRESS` for servers, the owning server for clients
    pub parent_address: String,
    pub is_master: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn is_parent(&self) -> bool {
        self.parent_address == NO_PARENT_ADDRESS
    }

    /// Live iff the lease has not run out at `now` (shared clock)
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Identity of the connection a call is made on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerContext {
    pub client_address: String,
    pub server_address: String,
}

impl CallerContext {
    pub fn new(client_address: impl Into<String>, server_address: impl Into<String>) -> Self {
        Self {
            client_address: client_address.into(),
            server_address: server_address.into(),
        }
    }

    /// Context for writes not tied to any connection
    pub fn detached() -> Self {
        Self::new(NO_CLIENT_ADDRESS, NO_SERVER_ADDRESS)
    }

    pub fn validate(&self) -> RollcallResult<()> {
        require_text(&self.client_address, "client address")?;
        require_text(&self.server_address, "server address")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_kinds() {
        assert!(ChangeKind::Created.is_live());
        assert!(ChangeKind::Updated.is_live());
        assert!(!ChangeKind::Deleted.is_live());
        assert!(!ChangeKind::OwnerDied.is_live());
    }

    #[test]
    fn test_change_event_serialization() {
        let event = ChangeEvent {
            subscriber: "10.0.0.5:40112".to_string(),
            server_address: "10.0.0.1:7070".to_string(),
            sequence: 7,
            kind: ChangeKind::OwnerDied,
            subject: ChangeSubject::association(
                ResourceKey::new("svc", "app1"),
                ResourceKey::new("host", "h1"),
            ),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"OWNER_DIED\""));
        assert!(json.contains("\"association\""));

        let parsed: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_resource_key_validation() {
        assert!(ResourceKey::new("svc", "app1").validate().is_ok());
        assert!(ResourceKey::new("", "app1").validate().is_err());
        assert!(ResourceKey::new("svc", " ").validate().is_err());
    }

    #[test]
    fn test_node_liveness() {
        let now = Utc::now();
        let node = NodeRecord {
            address: "10.0.0.1:7070".to_string(),
            parent_address: NO_PARENT_ADDRESS.to_string(),
            is_master: false,
            created_at: now,
            modified_at: now,
            expires_at: now + chrono::TimeDelta::seconds(10),
        };
        assert!(node.is_parent());
        assert!(node.is_live(now));
        assert!(!node.is_live(now + chrono::TimeDelta::seconds(11)));
    }
}
