//! A read/write lock manager for arbitrary keys.
//!
//! Lockers are granted shared (read) or exclusive (write) locks on keys. A locker that
//! holds a read lock may upgrade it to a write lock, and upgrade requests are queued ahead
//! of other waiters. New readers queue behind writers that are already waiting. Waits are
//! bounded by the manager's lock timeout and by the locker's own deadline, can be
//! interrupted, and are optionally checked for deadlocks, in which case the youngest
//! locker in the cycle is chosen as the victim.
//!
//! The caching server uses one manager with nodes as lockers, and every cache node uses
//! another to isolate its own concurrent transactions.

use hashbrown::{DefaultHashBuilder, HashMap};
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    hash::{BuildHasher, Hash},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, trace};

mod deadlock;
mod lock;
mod locker;

use lock::{Attempt, Lock};
pub use locker::{LockConflict, LockConflictKind, LockRequest, Locker};
use locker::WaitingFor;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("the lock timeout must not be less than 1 ms")]
    InvalidLockTimeout,

    #[error("the number of key maps must not be less than 1")]
    InvalidKeyMaps,

    #[error("the locker belongs to a different lock manager")]
    WrongLockManager,

    #[error("attempt to obtain a new lock while waiting")]
    AlreadyWaiting,

    #[error("locker must release its locks after a deadlock")]
    MustAbort,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of a lock call: `None` when the lock was granted.
pub type LockOutcome<L> = Option<LockConflict<L>>;

pub struct LockManager<K, L> {
    id: u64,
    lock_timeout: Duration,
    detect_deadlocks: bool,
    key_maps: Vec<Mutex<HashMap<K, Lock<K, L>>>>,
    hasher: DefaultHashBuilder,
}

impl<K, L> Debug for LockManager<K, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_timeout", &self.lock_timeout)
            .field("num_key_maps", &self.key_maps.len())
            .field("detect_deadlocks", &self.detect_deadlocks)
            .finish_non_exhaustive()
    }
}

impl<K, L> LockManager<K, L>
where
    K: Clone + Eq + Hash + Debug,
    L: Clone + Debug,
{
    /// Creates a manager whose waits last at most `lock_timeout`, with keys spread over
    /// `num_key_maps` independently synchronized maps.
    pub fn new(lock_timeout: Duration, num_key_maps: usize, detect_deadlocks: bool) -> Result<Self> {
        if lock_timeout < Duration::from_millis(1) {
            return Err(Error::InvalidLockTimeout);
        }
        if num_key_maps < 1 {
            return Err(Error::InvalidKeyMaps);
        }
        Ok(Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            lock_timeout,
            detect_deadlocks,
            key_maps: (0..num_key_maps)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            hasher: DefaultHashBuilder::default(),
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Creates a locker for this manager. Its waits also end at `deadline`, if given.
    pub fn new_locker(&self, payload: L, deadline: Option<Instant>) -> Arc<Locker<K, L>> {
        Arc::new(Locker::new(self.id, payload, deadline))
    }

    /// Obtains a lock, waiting if needed.
    pub fn lock(&self, locker: &Arc<Locker<K, L>>, key: K, for_write: bool) -> Result<LockOutcome<L>> {
        self.check_locker(locker)?;
        match self.lock_no_wait_internal(locker, key, for_write)? {
            None => Ok(None),
            Some(_) => self.wait_for_lock_internal(locker),
        }
    }

    /// Attempts to obtain a lock without waiting. A conflict of kind
    /// [`LockConflictKind::Blocked`] means the request was queued and the caller must
    /// follow up with [`Self::wait_for_lock`].
    pub fn lock_no_wait(
        &self,
        locker: &Arc<Locker<K, L>>,
        key: K,
        for_write: bool,
    ) -> Result<LockOutcome<L>> {
        self.check_locker(locker)?;
        self.lock_no_wait_internal(locker, key, for_write)
    }

    /// Waits for a request previously queued by [`Self::lock_no_wait`]. Returns `None`
    /// immediately if the locker is not waiting.
    pub fn wait_for_lock(&self, locker: &Arc<Locker<K, L>>) -> Result<LockOutcome<L>> {
        self.check_manager(locker)?;
        self.wait_for_lock_internal(locker)
    }

    /// Releases the locker's lock on `key`, if it holds one.
    pub fn release_lock(&self, locker: &Arc<Locker<K, L>>, key: &K) -> Result<()> {
        self.check_manager(locker)?;
        self.release_internal(locker, key, false);
        Ok(())
    }

    /// Downgrades the locker's write lock on `key` to a read lock. Does nothing if the
    /// locker does not hold a write lock.
    pub fn downgrade_lock(&self, locker: &Arc<Locker<K, L>>, key: &K) -> Result<()> {
        self.check_manager(locker)?;
        self.release_internal(locker, key, true);
        Ok(())
    }

    pub fn get_owners(&self, key: &K) -> Vec<LockRequest<K, L>> {
        self.key_map(key)
            .lock()
            .get(key)
            .map(|lock| lock.owners().to_vec())
            .unwrap_or_default()
    }

    pub fn get_waiters(&self, key: &K) -> Vec<LockRequest<K, L>> {
        self.key_map(key)
            .lock()
            .get(key)
            .map(|lock| lock.waiters().to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn key_map(&self, key: &K) -> &Mutex<HashMap<K, Lock<K, L>>> {
        let index = (self.hasher.hash_one(key) % self.key_maps.len() as u64) as usize;
        &self.key_maps[index]
    }

    fn check_manager(&self, locker: &Locker<K, L>) -> Result<()> {
        if locker.manager_id() != self.id {
            Err(Error::WrongLockManager)
        } else {
            Ok(())
        }
    }

    fn check_locker(&self, locker: &Locker<K, L>) -> Result<()> {
        self.check_manager(locker)?;
        let state = locker.state.lock();
        match &state.conflict {
            Some(conflict) if conflict.kind == LockConflictKind::Deadlock => Err(Error::MustAbort),
            _ => Ok(()),
        }
    }

    fn lock_no_wait_internal(
        &self,
        locker: &Arc<Locker<K, L>>,
        key: K,
        for_write: bool,
    ) -> Result<LockOutcome<L>> {
        {
            let mut state = locker.state.lock();
            if state.waiting_for.is_some() {
                return Err(Error::AlreadyWaiting);
            }
            if let Some(conflict) = &state.conflict {
                if conflict.kind == LockConflictKind::Deadlock {
                    return Err(Error::MustAbort);
                }
            }
            // An earlier timeout or interrupt no longer matters
            state.conflict = None;
        }

        let attempt = {
            let mut map = self.key_map(&key).lock();
            map.entry(key.clone())
                .or_insert_with(Lock::new)
                .lock(locker, &key, for_write, false)
        };
        let conflicting = match attempt {
            Attempt::AlreadyGranted | Attempt::Granted => {
                trace!(locker = ?locker.payload(), ?key, for_write, "lock granted");
                return Ok(None);
            }
            Attempt::Blocked { conflicting } => conflicting,
        };

        let payload = conflicting.payload().clone();
        locker.state.lock().waiting_for = Some(WaitingFor {
            key: key.clone(),
            for_write,
            conflicting: payload.clone(),
        });
        let mut conflict = None;
        if self.detect_deadlocks {
            conflict = deadlock::DeadlockChecker::new(self).check(locker);
        }
        let conflict =
            conflict.unwrap_or_else(|| LockConflict::new(LockConflictKind::Blocked, payload));
        debug!(locker = ?locker.payload(), ?key, for_write, ?conflict, "lock attempt blocked");
        Ok(Some(conflict))
    }

    fn wait_for_lock_internal(&self, locker: &Arc<Locker<K, L>>) -> Result<LockOutcome<L>> {
        let mut state = locker.state.lock();
        let Some(waiting) = state.waiting_for.clone() else {
            return Ok(None);
        };
        let mut now = Instant::now();
        let stop = match locker.deadline() {
            Some(deadline) => deadline.min(now + self.lock_timeout),
            None => now + self.lock_timeout,
        };
        let conflict = loop {
            if let Some(conflict) = state.conflict.clone() {
                break conflict;
            }
            if state.interrupted {
                state.interrupted = false;
                let conflict =
                    LockConflict::new(LockConflictKind::Interrupted, waiting.conflicting.clone());
                state.conflict = Some(conflict.clone());
                break conflict;
            }
            if now >= stop {
                let conflict =
                    LockConflict::new(LockConflictKind::Timeout, waiting.conflicting.clone());
                state.conflict = Some(conflict.clone());
                break conflict;
            }
            if self.is_owner(locker, &waiting.key, waiting.for_write) {
                state.waiting_for = None;
                trace!(locker = ?locker.payload(), key = ?waiting.key, "lock granted after wait");
                return Ok(None);
            }
            locker.cond.wait_until(&mut state, stop);
            now = Instant::now();
        };

        // Leave the queue, unless a release granted the lock in the meantime
        let granted = {
            let mut map = self.key_map(&waiting.key).lock();
            match map.get_mut(&waiting.key) {
                Some(lock) => {
                    lock.flush_waiter(locker).is_none() && lock.is_owner(locker, waiting.for_write)
                }
                None => false,
            }
        };
        state.waiting_for = None;
        if granted {
            state.conflict = None;
            return Ok(None);
        }
        debug!(locker = ?locker.payload(), key = ?waiting.key, ?conflict, "lock wait failed");
        Ok(Some(conflict))
    }

    fn is_owner(&self, locker: &Locker<K, L>, key: &K, for_write: bool) -> bool {
        self.key_map(key)
            .lock()
            .get(key)
            .is_some_and(|lock| lock.is_owner(locker, for_write))
    }

    fn release_internal(&self, locker: &Arc<Locker<K, L>>, key: &K, downgrade: bool) {
        let granted = {
            let mut map = self.key_map(key).lock();
            let Some(lock) = map.get_mut(key) else {
                return;
            };
            let granted = lock.release(locker, key, downgrade);
            if !lock.in_use() {
                map.remove(key);
            }
            granted
        };
        trace!(locker = ?locker.payload(), ?key, downgrade, granted = granted.len(), "lock released");
        for waiter in granted {
            waiter.notify();
        }
    }
}
