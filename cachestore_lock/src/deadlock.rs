//! Deadlock detection over the waits-for graph.

use crate::{LockConflict, LockConflictKind, LockManager, Locker};
use hashbrown::HashMap;
use std::{fmt::Debug, hash::Hash, sync::Arc};
use tracing::debug;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    OnPath,
    Done,
}

/// Walks the graph of lockers waiting for lock owners, starting from a locker that has
/// just been queued. Each cycle found loses its youngest member, which is marked as
/// deadlocked and woken.
pub(crate) struct DeadlockChecker<'a, K, L> {
    manager: &'a LockManager<K, L>,
    /// The owners each locker is waiting for, or `None` if it is not waiting.
    waiting_for: HashMap<u64, Option<Vec<Arc<Locker<K, L>>>>>,
}

impl<'a, K, L> DeadlockChecker<'a, K, L>
where
    K: Clone + Eq + Hash + Debug,
    L: Clone + Debug,
{
    pub(crate) fn new(manager: &'a LockManager<K, L>) -> Self {
        Self {
            manager,
            waiting_for: HashMap::new(),
        }
    }

    /// Returns a deadlock conflict if `root` was chosen as a victim, a blocked conflict
    /// if other lockers were, and `None` if there was no deadlock.
    pub(crate) fn check(mut self, root: &Arc<Locker<K, L>>) -> Option<LockConflict<L>> {
        let mut result = None;
        loop {
            let mut visits = HashMap::new();
            let mut path = vec![];
            let Some(cycle) = self.find_cycle(root, &mut visits, &mut path) else {
                return result;
            };

            let (victim_index, victim) = cycle
                .iter()
                .enumerate()
                .max_by_key(|(_, locker)| locker.requested_start())
                .map(|(i, locker)| (i, Arc::clone(locker)))?;
            let conflicting = Arc::clone(&cycle[(victim_index + 1) % cycle.len()]);
            debug!(
                root = ?root.payload(),
                victim = ?victim.payload(),
                cycle_len = cycle.len(),
                "deadlock detected"
            );

            let deadlock =
                LockConflict::new(LockConflictKind::Deadlock, conflicting.payload().clone());
            self.waiting_for.insert(victim.id(), None);
            victim.set_conflict(deadlock.clone());
            if victim.id() == root.id() {
                return Some(deadlock);
            }
            result = Some(LockConflict::new(
                LockConflictKind::Blocked,
                conflicting.payload().clone(),
            ));
        }
    }

    fn find_cycle(
        &mut self,
        locker: &Arc<Locker<K, L>>,
        visits: &mut HashMap<u64, Visit>,
        path: &mut Vec<Arc<Locker<K, L>>>,
    ) -> Option<Vec<Arc<Locker<K, L>>>> {
        visits.insert(locker.id(), Visit::OnPath);
        path.push(Arc::clone(locker));
        for owner in self.owners_waited_for(locker) {
            if owner.id() == locker.id() || self.owners_waited_for(&owner).is_empty() {
                continue;
            }
            match visits.get(&owner.id()).copied() {
                Some(Visit::OnPath) => {
                    let start = path.iter().position(|l| l.id() == owner.id())?;
                    return Some(path[start..].to_vec());
                }
                Some(Visit::Done) => {}
                None => {
                    if let Some(cycle) = self.find_cycle(&owner, visits, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        visits.insert(locker.id(), Visit::Done);
        None
    }

    fn owners_waited_for(&mut self, locker: &Arc<Locker<K, L>>) -> Vec<Arc<Locker<K, L>>> {
        if let Some(cached) = self.waiting_for.get(&locker.id()) {
            return cached.clone().unwrap_or_default();
        }
        let key = {
            let state = locker.state.lock();
            match (&state.waiting_for, &state.conflict) {
                (Some(waiting), None) => Some(waiting.key.clone()),
                _ => None,
            }
        };
        let owners: Option<Vec<Arc<Locker<K, L>>>> = key.map(|key| {
            self.manager
                .key_map(&key)
                .lock()
                .get(&key)
                .map(|lock| {
                    lock.owners()
                        .iter()
                        .map(|r| Arc::clone(r.locker()))
                        .collect()
                })
                .unwrap_or_default()
        });
        self.waiting_for.insert(locker.id(), owners.clone());
        owners.unwrap_or_default()
    }
}
