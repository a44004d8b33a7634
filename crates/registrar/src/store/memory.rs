//! Process-local gateway.

use chrono::{DateTime, TimeDelta, Utc};
use rollcall_common::RollcallResult;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Gateway, Tables, Tx};

/// Gateway keeping all tables in this process.
///
/// Transactions run against a copy of the tables which replaces the
/// stored tables only when the closure succeeds.
#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<Tables>,
    /// Offset applied to the wall clock (milliseconds)
    clock_skew_ms: AtomicI64,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the shared clock forward
    pub fn advance_clock(&self, by: Duration) {
        self.clock_skew_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    fn clock(&self) -> DateTime<Utc> {
        Utc::now() + TimeDelta::milliseconds(self.clock_skew_ms.load(Ordering::SeqCst))
    }
}

impl Gateway for MemoryGateway {
    async fn now(&self) -> RollcallResult<DateTime<Utc>> {
        Ok(self.clock())
    }

    async fn read<R, F>(&self, f: F) -> RollcallResult<R>
    where
        R: Send,
        F: FnOnce(&Tables, DateTime<Utc>) -> RollcallResult<R> + Send,
    {
        let now = self.clock();
        let tables = self.tables.lock().await;
        f(&tables, now)
    }

    async fn transaction<R, F>(&self, f: F) -> RollcallResult<R>
    where
        R: Send,
        F: FnOnce(&mut Tx<'_>) -> RollcallResult<R> + Send,
    {
        let now = self.clock();
        let mut tables = self.tables.lock().await;
        let mut draft = tables.clone();
        let output = f(&mut Tx::new(&mut draft, now))?;
        *tables = draft;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_common::RollcallError;

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let gateway = MemoryGateway::new();

        let result: RollcallResult<()> = gateway
            .transaction(|tx| {
                tx.next_sequence();
                tx.next_sequence();
                Err(RollcallError::conflict("abort"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(gateway.current_sequence().await.unwrap(), 0);

        let seq = gateway.transaction(|tx| Ok(tx.next_sequence())).await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(gateway.current_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_advance_clock() {
        let gateway = MemoryGateway::new();
        let before = gateway.now().await.unwrap();
        gateway.advance_clock(Duration::from_secs(11));
        let after = gateway.now().await.unwrap();
        assert!(after - before >= TimeDelta::seconds(11));
    }
}
