//! Per-table invocation locks.
//!
//! Each table is mutated by at most one in-flight merge invocation. An
//! overlapping invocation either waits for the lock or is rejected with
//! `MergeError::InvocationInProgress`, depending on [`ConcurrencyPolicy`].

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use serde::{Deserialize, Serialize};

use crate::error::MergeError;
use crate::model::TableId;

/// What an overlapping invocation does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Wait until the in-flight invocation finishes.
    #[default]
    Block,
    /// Fail immediately.
    Reject,
}

/// One mutex per table.
#[derive(Debug)]
pub struct InvocationLocks {
    policy: ConcurrencyPolicy,
    slots: [Mutex<()>; TableId::COUNT],
}

/// Proof that the holder owns a table for the current invocation.
#[derive(Debug)]
pub struct InvocationGuard<'a> {
    table: TableId,
    _guard: MutexGuard<'a, ()>,
}

impl InvocationGuard<'_> {
    #[must_use]
    pub const fn table(&self) -> TableId {
        self.table
    }
}

impl InvocationLocks {
    #[must_use]
    pub fn new(policy: ConcurrencyPolicy) -> Self {
        Self {
            policy,
            slots: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    /// Takes the lock of `table`.
    ///
    /// A lock poisoned by a panicking invocation is taken over: the table
    /// copy that invocation worked on was never committed.
    ///
    /// # Errors
    ///
    /// Returns `MergeError::InvocationInProgress` under `Reject` when the
    /// table is busy.
    pub fn acquire(&self, table: TableId) -> Result<InvocationGuard<'_>, MergeError> {
        let slot = &self.slots[table.index()];
        let guard = match self.policy {
            ConcurrencyPolicy::Block => slot.lock().unwrap_or_else(PoisonError::into_inner),
            ConcurrencyPolicy::Reject => match slot.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    return Err(MergeError::InvocationInProgress { table })
                }
            },
        };
        Ok(InvocationGuard { table, _guard: guard })
    }
}

impl Default for InvocationLocks {
    fn default() -> Self {
        Self::new(ConcurrencyPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;

    #[test]
    fn reject_policy_fails_fast() {
        let locks = InvocationLocks::new(ConcurrencyPolicy::Reject);
        let table = TableId::Conformed(EntityKind::Product);
        let held = locks.acquire(table).unwrap();
        assert_eq!(held.table(), table);
        assert_eq!(
            locks.acquire(table).unwrap_err(),
            MergeError::InvocationInProgress { table }
        );
        // Other tables stay available.
        assert!(locks.acquire(TableId::Facts).is_ok());
        drop(held);
        assert!(locks.acquire(table).is_ok());
    }

    #[test]
    fn block_policy_waits_for_release() {
        use std::sync::Arc;
        use std::time::Duration;

        let locks = Arc::new(InvocationLocks::new(ConcurrencyPolicy::Block));
        let table = TableId::Facts;
        let held = locks.acquire(table).unwrap();

        let other = Arc::clone(&locks);
        let waiter = std::thread::spawn(move || other.acquire(table).map(|g| g.table()));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), table);
    }
}
