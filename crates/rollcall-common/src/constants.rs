//! Shared constants for Rollcall components.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default registrar HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7070";

/// Node lease duration (seconds)
pub const DEFAULT_LEASE_SECS: u64 = 20;

/// Longest lease a node may hold (one day)
pub const MAX_LEASE_SECS: u64 = 86_400;

/// Leader timer period (seconds)
pub const DEFAULT_LEADER_PERIOD_SECS: u64 = 5;

/// Change dispatcher period (seconds)
pub const DEFAULT_DISPATCH_PERIOD_SECS: u64 = 1;

/// Upper bound for a single push to one recipient (milliseconds)
pub const DEFAULT_PUSH_TIMEOUT_MS: u64 = 5000;

/// Maximum resource snapshots held by the local cache
pub const DEFAULT_MAX_CACHED_RESOURCES: u64 = 100_000;

/// Events queued per client connection before pushes start waiting
pub const DEFAULT_CONNECTION_BUFFER: usize = 256;

/// Expiry of the store transaction lock (milliseconds)
pub const DEFAULT_LOCK_TTL_MS: u64 = 5000;

/// How long a transaction waits for the store lock (milliseconds)
pub const DEFAULT_LOCK_WAIT_MS: u64 = 2000;

/// Version assigned to a resource on its first write
pub const INITIAL_VERSION: u64 = 1;

/// Parent address recorded for top-level (server) nodes
pub const NO_PARENT_ADDRESS: &str = "-";

/// Client address recorded for writes made without a connection
pub const NO_CLIENT_ADDRESS: &str = "-";

/// Server address recorded for writes made without a connection
pub const NO_SERVER_ADDRESS: &str = "-";

/// Redis key names
pub mod redis_keys {
    /// Serialized coordination tables
    pub const TABLES: &str = "rollcall:tables";

    /// Transaction lock guarding `TABLES`
    pub const TABLES_LOCK: &str = "rollcall:tables:lock";
}

/// HTTP header names
pub mod headers {
    /// Caller's client address (as announced by the `hello` event)
    pub const X_CLIENT_ADDRESS: &str = "X-Client-Address";

    /// Node ID header (server peers only)
    pub const X_NODE_ID: &str = "X-Node-Id";
}
