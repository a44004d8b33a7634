//! Persistence gateway.
//!
//! Every piece of coordination state lives behind a [`Gateway`]: one set of
//! logical [`Tables`], a shared clock, and a shared sequence counter. A
//! transaction runs a closure against the tables; an `Err` from the closure
//! rolls back everything it touched.
//!
//! Implementations:
//! - [`MemoryGateway`] - process-local (single node, tests)
//! - [`RedisGateway`] - shared across the cluster

mod memory;
mod redis_gateway;
mod tables;

pub use memory::MemoryGateway;
pub use redis_gateway::RedisGateway;
pub use tables::{AssociationRow, AttributeRow, ResourceRow, Tables};

use chrono::{DateTime, Utc};
use rollcall_common::RollcallResult;
use std::future::Future;

/// Write access handed to a transaction closure
pub struct Tx<'a> {
    pub tables: &'a mut Tables,
    now: DateTime<Utc>,
}

impl<'a> Tx<'a> {
    pub fn new(tables: &'a mut Tables, now: DateTime<Utc>) -> Self {
        Self { tables, now }
    }

    /// Shared clock, read once when the transaction started
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Allocate the next change sequence number
    pub fn next_sequence(&mut self) -> u64 {
        self.tables.sequence += 1;
        self.tables.sequence
    }
}

/// Transactional access to the shared coordination store
pub trait Gateway: Send + Sync + 'static {
    /// Shared "now" used for every expiry comparison
    fn now(&self) -> impl Future<Output = RollcallResult<DateTime<Utc>>> + Send;

    /// Run a read-only closure against a consistent snapshot
    fn read<R, F>(&self, f: F) -> impl Future<Output = RollcallResult<R>> + Send
    where
        R: Send,
        F: FnOnce(&Tables, DateTime<Utc>) -> RollcallResult<R> + Send;

    /// Run a closure atomically; nothing is committed unless it returns `Ok`
    fn transaction<R, F>(&self, f: F) -> impl Future<Output = RollcallResult<R>> + Send
    where
        R: Send,
        F: FnOnce(&mut Tx<'_>) -> RollcallResult<R> + Send;

    /// Highest sequence allocated so far
    fn current_sequence(&self) -> impl Future<Output = RollcallResult<u64>> + Send {
        self.read(|tables, _| Ok(tables.sequence))
    }
}

/// Backend selected at startup
pub enum AnyGateway {
    Memory(MemoryGateway),
    Redis(RedisGateway),
}

impl Gateway for AnyGateway {
    async fn now(&self) -> RollcallResult<DateTime<Utc>> {
        match self {
            Self::Memory(gateway) => gateway.now().await,
            Self::Redis(gateway) => gateway.now().await,
        }
    }

    async fn read<R, F>(&self, f: F) -> RollcallResult<R>
    where
        R: Send,
        F: FnOnce(&Tables, DateTime<Utc>) -> RollcallResult<R> + Send,
    {
        match self {
            Self::Memory(gateway) => gateway.read(f).await,
            Self::Redis(gateway) => gateway.read(f).await,
        }
    }

    async fn transaction<R, F>(&self, f: F) -> RollcallResult<R>
    where
        R: Send,
        F: FnOnce(&mut Tx<'_>) -> RollcallResult<R> + Send,
    {
        match self {
            Self::Memory(gateway) => gateway.transaction(f).await,
            Self::Redis(gateway) => gateway.transaction(f).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Gateway double that can fail or interleave chosen transactions.

    use super::*;
    use rollcall_common::RollcallError;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Hook = Box<dyn FnOnce(&mut Tables) + Send>;

    enum Step {
        Fail,
        Before(Hook),
    }

    /// Wraps a [`MemoryGateway`]; transactions are numbered from 1
    pub struct ScriptedGateway {
        pub inner: MemoryGateway,
        transactions: AtomicUsize,
        steps: Mutex<BTreeMap<usize, Step>>,
    }

    impl ScriptedGateway {
        pub fn new() -> Self {
            Self {
                inner: MemoryGateway::new(),
                transactions: AtomicUsize::new(0),
                steps: Mutex::new(BTreeMap::new()),
            }
        }

        /// The `nth` transaction from now fails without touching the tables
        pub fn fail_in(&self, nth: usize) {
            let at = self.transactions.load(Ordering::SeqCst) + nth;
            self.steps.lock().unwrap().insert(at, Step::Fail);
        }

        /// Commit `hook` on its own right before the `nth` transaction from now
        pub fn before_in(&self, nth: usize, hook: impl FnOnce(&mut Tables) + Send + 'static) {
            let at = self.transactions.load(Ordering::SeqCst) + nth;
            self.steps
                .lock()
                .unwrap()
                .insert(at, Step::Before(Box::new(hook)));
        }
    }

    impl Gateway for ScriptedGateway {
        async fn now(&self) -> RollcallResult<DateTime<Utc>> {
            self.inner.now().await
        }

        async fn read<R, F>(&self, f: F) -> RollcallResult<R>
        where
            R: Send,
            F: FnOnce(&Tables, DateTime<Utc>) -> RollcallResult<R> + Send,
        {
            self.inner.read(f).await
        }

        async fn transaction<R, F>(&self, f: F) -> RollcallResult<R>
        where
            R: Send,
            F: FnOnce(&mut Tx<'_>) -> RollcallResult<R> + Send,
        {
            let n = self.transactions.fetch_add(1, Ordering::SeqCst) + 1;
            let step = self.steps.lock().unwrap().remove(&n);
            match step {
                Some(Step::Fail) => {
                    return Err(RollcallError::Timeout("store lock wait".to_string()));
                }
                Some(Step::Before(hook)) => {
                    self.inner
                        .transaction(|tx| {
                            hook(tx.tables);
                            Ok(())
                        })
                        .await?;
                }
                None => {}
            }
            self.inner.transaction(f).await
        }
    }
}
