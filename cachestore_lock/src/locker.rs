use parking_lot::{Condvar, Mutex};
use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

static NEXT_LOCKER_ID: AtomicU64 = AtomicU64::new(1);

/// Why a lock request was not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockConflictKind {
    /// The request is queued behind the conflicting locker. Only returned by
    /// [`LockManager::lock_no_wait`](crate::LockManager::lock_no_wait).
    Blocked,
    /// The request was not granted before the locker's deadline.
    Timeout,
    /// The locker was chosen as the victim of a deadlock and must release its locks.
    Deadlock,
    /// The locker was interrupted while waiting.
    Interrupted,
}

/// A refused or still pending lock request, naming a locker that stands in the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict<L> {
    pub kind: LockConflictKind,
    pub conflicting: L,
}

impl<L> LockConflict<L> {
    pub(crate) fn new(kind: LockConflictKind, conflicting: L) -> Self {
        Self { kind, conflicting }
    }
}

/// Something that requests locks: a remote node on the server, or a transaction
/// inside a node. The payload `L` identifies it to callers.
pub struct Locker<K, L> {
    id: u64,
    manager_id: u64,
    payload: L,
    requested_start: Instant,
    deadline: Option<Instant>,
    pub(crate) state: Mutex<LockerState<K, L>>,
    pub(crate) cond: Condvar,
}

pub(crate) struct LockerState<K, L> {
    pub(crate) waiting_for: Option<WaitingFor<K, L>>,
    pub(crate) conflict: Option<LockConflict<L>>,
    pub(crate) interrupted: bool,
}

#[derive(Clone)]
pub(crate) struct WaitingFor<K, L> {
    pub(crate) key: K,
    pub(crate) for_write: bool,
    pub(crate) conflicting: L,
}

impl<K, L> Locker<K, L> {
    pub(crate) fn new(manager_id: u64, payload: L, deadline: Option<Instant>) -> Self {
        Self {
            id: NEXT_LOCKER_ID.fetch_add(1, Ordering::Relaxed),
            manager_id,
            payload,
            requested_start: Instant::now(),
            deadline,
            state: Mutex::new(LockerState {
                waiting_for: None,
                conflict: None,
                interrupted: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn payload(&self) -> &L {
        &self.payload
    }

    /// When the locker first asked for a lock; younger lockers lose deadlocks.
    pub fn requested_start(&self) -> Instant {
        self.requested_start
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn manager_id(&self) -> u64 {
        self.manager_id
    }

    /// Wakes the locker if it is waiting for a lock, making the wait return
    /// [`LockConflictKind::Interrupted`]. An interrupt delivered while the locker is not
    /// waiting applies to its next wait.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    /// Forgets the outcome of the last failed wait, including a deadlock, once the
    /// locker has released the locks that formed the cycle.
    pub fn clear_conflict(&self) {
        self.state.lock().conflict = None;
    }

    /// Whether the locker is queued for a lock.
    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiting_for.is_some()
    }

    pub(crate) fn set_conflict(&self, conflict: LockConflict<L>) {
        let mut state = self.state.lock();
        state.conflict = Some(conflict);
        self.cond.notify_all();
    }

    pub(crate) fn notify(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

impl<K, L: Debug> Debug for Locker<K, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// A granted or queued request for a single key.
pub struct LockRequest<K, L> {
    locker: Arc<Locker<K, L>>,
    key: K,
    for_write: bool,
    upgrade: bool,
    callback_noted: Arc<AtomicBool>,
}

impl<K: Clone, L> Clone for LockRequest<K, L> {
    fn clone(&self) -> Self {
        Self {
            locker: Arc::clone(&self.locker),
            key: self.key.clone(),
            for_write: self.for_write,
            upgrade: self.upgrade,
            callback_noted: Arc::clone(&self.callback_noted),
        }
    }
}

impl<K, L> LockRequest<K, L> {
    pub(crate) fn new(locker: Arc<Locker<K, L>>, key: K, for_write: bool, upgrade: bool) -> Self {
        Self {
            locker,
            key,
            for_write,
            upgrade,
            callback_noted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn locker(&self) -> &Arc<Locker<K, L>> {
        &self.locker
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn for_write(&self) -> bool {
        self.for_write
    }

    /// Whether this is a request to upgrade a read lock already held.
    pub fn upgrade(&self) -> bool {
        self.upgrade
    }

    /// Returns `true` the first time it is called for this grant, so that each owner is
    /// asked to give the lock up at most once.
    pub fn note_callback(&self) -> bool {
        !self.callback_noted.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_for(&self, locker: &Locker<K, L>) -> bool {
        self.locker.id() == locker.id()
    }
}

impl<K: Debug, L: Debug> Debug for LockRequest<K, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRequest")
            .field("locker", &self.locker.payload())
            .field("key", &self.key)
            .field("for_write", &self.for_write)
            .field("upgrade", &self.upgrade)
            .finish()
    }
}
