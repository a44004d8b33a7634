//! Cluster coordination modules.
//!
//! Implements:
//! - Node liveness & leader election (lease expiry in the shared store)
//! - Leader timer (renewal, election, reaping, membership)
//! - Change dispatch to locally connected subscribers

mod dispatcher;
mod leader;
mod registry;

pub use dispatcher::{ChangeDispatcher, DispatchReport, DispatcherConfig};
pub use leader::{ClusterView, LeaderTimer, connection_worker};
pub use registry::NodeRegistry;
