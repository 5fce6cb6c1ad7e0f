//! The owners and waiters of a single key.

use crate::locker::{LockRequest, Locker};
use std::sync::Arc;

pub(crate) struct Lock<K, L> {
    owners: Vec<LockRequest<K, L>>,
    waiters: Vec<LockRequest<K, L>>,
}

pub(crate) enum Attempt<K, L> {
    /// The locker already held a lock good enough for the request.
    AlreadyGranted,
    Granted,
    /// Queued, or left queued when the request came from an existing waiter.
    Blocked {
        conflicting: Arc<Locker<K, L>>,
    },
}

impl<K: Clone, L> Lock<K, L> {
    pub(crate) fn new() -> Self {
        Self {
            owners: Vec::with_capacity(2),
            waiters: Vec::with_capacity(2),
        }
    }

    /// Attempts to grant `locker` the lock. `waiting` is set when retrying on behalf of
    /// a locker that is already in the waiter list.
    pub(crate) fn lock(
        &mut self,
        locker: &Arc<Locker<K, L>>,
        key: &K,
        for_write: bool,
        waiting: bool,
    ) -> Attempt<K, L> {
        let mut upgrade = false;
        if let Some(own) = self.owners.iter().find(|r| r.is_for(locker)) {
            if for_write && !own.for_write() {
                upgrade = true;
            } else {
                return Attempt::AlreadyGranted;
            }
        }

        let mut conflicting = self
            .owners
            .iter()
            .find(|r| !r.is_for(locker) && (for_write || r.for_write()))
            .map(|r| Arc::clone(r.locker()));
        if conflicting.is_none() && !for_write && !waiting && !self.owners.is_empty() {
            // Reads queue behind writes that are already waiting
            conflicting = self.waiters.first().map(|w| Arc::clone(w.locker()));
        }

        match conflicting {
            None => {
                if upgrade {
                    self.owners.retain(|r| !r.is_for(locker));
                }
                let request = if waiting {
                    self.flush_waiter(locker)
                } else {
                    None
                };
                let request = request.unwrap_or_else(|| {
                    LockRequest::new(Arc::clone(locker), key.clone(), for_write, upgrade)
                });
                self.owners.push(request);
                Attempt::Granted
            }
            Some(conflicting) => {
                if !waiting {
                    self.add_waiter(LockRequest::new(
                        Arc::clone(locker),
                        key.clone(),
                        for_write,
                        upgrade,
                    ));
                }
                Attempt::Blocked { conflicting }
            }
        }
    }

    // Upgrades go ahead of every non-upgrade waiter.
    fn add_waiter(&mut self, request: LockRequest<K, L>) {
        if request.upgrade() {
            let position = self
                .waiters
                .iter()
                .position(|w| !w.upgrade())
                .unwrap_or(self.waiters.len());
            self.waiters.insert(position, request);
        } else {
            self.waiters.push(request);
        }
    }

    /// Releases or downgrades the locker's lock, returning the waiters that were granted
    /// the lock as a result.
    pub(crate) fn release(
        &mut self,
        locker: &Arc<Locker<K, L>>,
        key: &K,
        downgrade: bool,
    ) -> Vec<Arc<Locker<K, L>>> {
        let Some(position) = self.owners.iter().position(|r| r.is_for(locker)) else {
            return vec![];
        };
        if downgrade {
            if !self.owners[position].for_write() {
                return vec![];
            }
            self.owners[position] = LockRequest::new(Arc::clone(locker), key.clone(), false, false);
        } else {
            self.owners.remove(position);
        }

        let mut granted = vec![];
        while let Some(waiter) = self.waiters.first() {
            let waiter_locker = Arc::clone(waiter.locker());
            let for_write = waiter.for_write();
            match self.lock(&waiter_locker, key, for_write, true) {
                Attempt::Blocked { .. } => break,
                Attempt::Granted => granted.push(waiter_locker),
                Attempt::AlreadyGranted => {
                    self.flush_waiter(&waiter_locker);
                    granted.push(waiter_locker);
                }
            }
        }
        granted
    }

    /// Removes the locker from the waiters, returning its request if it was present.
    pub(crate) fn flush_waiter(&mut self, locker: &Locker<K, L>) -> Option<LockRequest<K, L>> {
        let position = self.waiters.iter().position(|w| w.is_for(locker))?;
        Some(self.waiters.remove(position))
    }

    pub(crate) fn is_owner(&self, locker: &Locker<K, L>, for_write: bool) -> bool {
        self.owners
            .iter()
            .find(|r| r.is_for(locker))
            .is_some_and(|owner| !for_write || owner.for_write())
    }

    pub(crate) fn in_use(&self) -> bool {
        !self.owners.is_empty() || !self.waiters.is_empty()
    }

    pub(crate) fn owners(&self) -> &[LockRequest<K, L>] {
        &self.owners
    }

    pub(crate) fn waiters(&self) -> &[LockRequest<K, L>] {
        &self.waiters
    }
}
