//! Registry of open transactions, keyed by handle.

use super::driver::{DbSession, Driver};
use crate::error::{EtlError, EtlResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Opaque transaction identifier. Values `<= 0` mean "no explicit
/// transaction": each operation runs in its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TxHandle(pub i64);

impl TxHandle {
    pub const AUTO: TxHandle = TxHandle(0);

    pub fn is_auto(&self) -> bool {
        self.0 <= 0
    }
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

type SharedSession = Arc<Mutex<Box<dyn DbSession>>>;

/// Maps handles to sessions with an open transaction. Safe to use from
/// concurrent flush tasks; statements on one handle are serialized.
#[derive(Default)]
pub struct TransactionStore {
    next: AtomicI64,
    open: DashMap<TxHandle, SharedSession>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session, begin a transaction on it and register it.
    pub async fn start(&self, driver: &dyn Driver) -> EtlResult<TxHandle> {
        let mut session = driver.open().await?;
        session.begin().await?;
        let handle = TxHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.open.insert(handle, Arc::new(Mutex::new(session)));
        debug!(%handle, "transaction started");
        Ok(handle)
    }

    pub async fn commit(&self, handle: TxHandle) -> EtlResult<()> {
        let session = self.take(handle)?;
        let mut session = session.lock().await;
        session.commit().await?;
        debug!(%handle, "transaction committed");
        Ok(())
    }

    pub async fn rollback(&self, handle: TxHandle) -> EtlResult<()> {
        let session = self.take(handle)?;
        let mut session = session.lock().await;
        session.rollback().await?;
        debug!(%handle, "transaction rolled back");
        Ok(())
    }

    /// A session to run one operation on: the registered one for an
    /// explicit handle, or a fresh private transaction otherwise.
    pub async fn acquire(&self, driver: &dyn Driver, handle: TxHandle) -> EtlResult<Scope> {
        if handle.is_auto() {
            let mut session = driver.open().await?;
            session.begin().await?;
            return Ok(Scope::Private(session));
        }
        let shared = self
            .open
            .get(&handle)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| unknown(handle))?;
        Ok(Scope::Shared(shared.lock_owned().await))
    }

    /// Number of transactions still open.
    pub fn active(&self) -> usize {
        self.open.len()
    }

    fn take(&self, handle: TxHandle) -> EtlResult<SharedSession> {
        self.open
            .remove(&handle)
            .map(|(_, session)| session)
            .ok_or_else(|| unknown(handle))
    }
}

fn unknown(handle: TxHandle) -> EtlError {
    EtlError::Transaction(format!("unknown or finished transaction {}", handle))
}

/// A session borrowed for the duration of one operation.
pub enum Scope {
    Shared(OwnedMutexGuard<Box<dyn DbSession>>),
    Private(Box<dyn DbSession>),
}

impl Scope {
    pub fn session(&mut self) -> &mut dyn DbSession {
        match self {
            Scope::Shared(guard) => guard.as_mut(),
            Scope::Private(session) => session.as_mut(),
        }
    }

    /// End the operation. A private transaction commits on success and
    /// rolls back on failure; a shared one is left to its owner.
    pub async fn finish<T>(self, result: EtlResult<T>) -> EtlResult<T> {
        match self {
            Scope::Shared(_) => result,
            Scope::Private(mut session) => match result {
                Ok(value) => {
                    session.commit().await?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback) = session.rollback().await {
                        debug!(error = %rollback, "rollback after failure also failed");
                    }
                    Err(e)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDriver;

    #[tokio::test]
    async fn test_start_commit_and_double_commit() {
        let driver = RecordingDriver::default();
        let store = TransactionStore::new();
        let handle = store.start(&driver).await.unwrap();
        assert!(!handle.is_auto());
        assert_eq!(store.active(), 1);
        store.commit(handle).await.unwrap();
        assert_eq!(store.active(), 0);
        assert!(matches!(
            store.commit(handle).await.unwrap_err(),
            EtlError::Transaction(_)
        ));
        assert_eq!(driver.log(), vec!["BEGIN", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let driver = RecordingDriver::default();
        let store = TransactionStore::new();
        assert!(store.rollback(TxHandle(42)).await.is_err());
        assert!(store.acquire(&driver, TxHandle(42)).await.is_err());
    }

    #[tokio::test]
    async fn test_private_scope_commits_or_rolls_back() {
        let driver = RecordingDriver::default();
        let store = TransactionStore::new();

        let scope = store.acquire(&driver, TxHandle::AUTO).await.unwrap();
        scope.finish(Ok(())).await.unwrap();

        let scope = store.acquire(&driver, TxHandle(-1)).await.unwrap();
        let result: EtlResult<()> = Err(EtlError::Cancelled);
        assert!(scope.finish(result).await.unwrap_err().is_cancelled());

        assert_eq!(driver.log(), vec!["BEGIN", "COMMIT", "BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_shared_scope_leaves_transaction_open() {
        let driver = RecordingDriver::default();
        let store = TransactionStore::new();
        let handle = store.start(&driver).await.unwrap();
        let scope = store.acquire(&driver, handle).await.unwrap();
        scope.finish(Ok(())).await.unwrap();
        assert_eq!(store.active(), 1);
        store.rollback(handle).await.unwrap();
        assert_eq!(driver.log(), vec!["BEGIN", "ROLLBACK"]);
    }
}
