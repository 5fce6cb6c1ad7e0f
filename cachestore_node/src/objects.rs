//! Object operations, and the jobs that fetch objects from the server.

use crate::{
    cache::{AwaitWritable, MAX_RETRIES},
    entry::{Entry, ObjectValue, State},
    store::StoreInner,
    txn::{SavedObject, Transaction, TxnShared},
};
use bytes::Bytes;
use cachestore_api::{DataKey, Error, Result};
use cachestore_id::ObjectId;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    Read,
    Write,
    /// Upgrade a read-only entry.
    Upgrade,
}

impl Transaction {
    /// Returns the object's data.
    pub fn get_object(&mut self, oid: ObjectId) -> Result<Bytes> {
        self.operation("get_object", |txn| {
            txn.lock_access(DataKey::Object(oid), false)?;
            txn.with_object(oid, false, |entry| data_of(oid, entry))
        })
    }

    /// Returns the object's data, with write access so that it can be changed without
    /// another round trip to the server.
    pub fn get_object_for_update(&mut self, oid: ObjectId) -> Result<Bytes> {
        self.operation("get_object_for_update", |txn| {
            txn.lock_access(DataKey::Object(oid), true)?;
            txn.with_object(oid, true, |entry| data_of(oid, entry))
        })
    }

    /// Obtains write access to an object without changing it.
    pub fn mark_for_update(&mut self, oid: ObjectId) -> Result<()> {
        self.operation("mark_for_update", |txn| {
            txn.lock_access(DataKey::Object(oid), true)?;
            txn.with_object(oid, true, |entry| {
                if entry.value.exists() {
                    Ok(())
                } else {
                    Err(Error::ObjectNotFound(oid))
                }
            })
        })
    }

    pub fn set_object(&mut self, oid: ObjectId, data: Bytes) -> Result<()> {
        self.operation("set_object", |txn| {
            txn.lock_access(DataKey::Object(oid), true)?;
            txn.modify_object(oid, |value| match value {
                ObjectValue::Removed => Err(Error::ObjectNotFound(oid)),
                _ => Ok(ObjectValue::Data(data)),
            })
        })
    }

    /// Sets each object in turn, stopping at the first failure.
    pub fn set_objects(&mut self, objects: impl IntoIterator<Item = (ObjectId, Bytes)>) -> Result<()> {
        for (oid, data) in objects {
            self.set_object(oid, data)?;
        }
        Ok(())
    }

    pub fn remove_object(&mut self, oid: ObjectId) -> Result<()> {
        self.operation("remove_object", |txn| {
            txn.lock_access(DataKey::Object(oid), true)?;
            txn.modify_object(oid, |value| match value {
                ObjectValue::Data(_) => Ok(ObjectValue::Removed),
                ObjectValue::New | ObjectValue::Removed => Err(Error::ObjectNotFound(oid)),
            })
        })
    }

    /// Creates an object with a new id. It has no data until it is set, and exists on
    /// the server once the transaction commits.
    pub fn create_object(&mut self) -> Result<ObjectId> {
        self.operation("create_object", |txn| {
            let store = Arc::clone(&txn.store);
            let oid = store.object_ids.next()?;
            txn.lock_access(DataKey::Object(oid), true)?;
            let mut reservation = store.cache.reservations().reserve(1, Some(txn.deadline()))?;
            store.cache.lock_object(oid).add_object(
                oid,
                State::CachedDirty,
                txn.context_id,
                ObjectValue::New,
                &mut reservation,
            )?;
            txn.modified_objects.push(SavedObject {
                oid,
                restore: ObjectValue::Removed,
                created: true,
            });
            trace!(context_id = %txn.context_id, %oid, "created object");
            Ok(oid)
        })
    }

    /// Returns the first existing object after `oid`, or the first of all if `oid` is
    /// `None`, counting objects this transaction created and not those it removed.
    pub fn next_object_id(&mut self, oid: Option<ObjectId>) -> Result<Option<ObjectId>> {
        self.operation("next_object_id", |txn| {
            let mut cursor = oid;
            for _ in 0..MAX_RETRIES {
                let from_server = txn.next_object_from_server(cursor)?;
                let created = txn
                    .modified_objects
                    .iter()
                    .filter(|saved| saved.created && cursor.is_none_or(|cursor| saved.oid > cursor))
                    .map(|saved| saved.oid)
                    .min();
                let candidate = match (from_server, created) {
                    (Some(a), Some(b)) => a.min(b),
                    (a, b) => match a.or(b) {
                        Some(candidate) => candidate,
                        None => return Ok(None),
                    },
                };
                txn.lock_access(DataKey::Object(candidate), false)?;
                if txn.with_object(candidate, false, |entry| Ok(entry.value.exists()))? {
                    return Ok(Some(candidate));
                }
                cursor = Some(candidate);
            }
            Err(Error::ResourceExhausted(
                "too many retries looking for the next object".to_string(),
            ))
        })
    }

    /// Asks the server for the object after `cursor`, caching what it returns.
    fn next_object_from_server(&mut self, cursor: Option<ObjectId>) -> Result<Option<ObjectId>> {
        let store = Arc::clone(&self.store);
        let found = store.config.retry.run("next_object_id", || {
            store.server.next_object_id(store.node_id, cursor)
        })?;
        let Some(found) = found else {
            return Ok(None);
        };
        let oid = found.oid;
        let mut reservation = store.cache.reservations().reserve(1, Some(self.deadline()))?;
        let mut bucket = store.cache.lock_object(oid);
        if bucket.current_object(oid).is_none() {
            bucket.add_object(
                oid,
                State::CachedRead,
                self.context_id,
                ObjectValue::Data(found.data),
                &mut reservation,
            )?;
        }
        drop(bucket);
        store.follow_up(DataKey::Object(oid), found.callback_evict, false);
        Ok(Some(oid))
    }

    /// Applies `change` to the object's value, saving the value it had before the
    /// transaction first changed it.
    fn modify_object(
        &mut self,
        oid: ObjectId,
        change: impl FnOnce(&ObjectValue) -> Result<ObjectValue>,
    ) -> Result<()> {
        let restore = self.with_object(oid, true, |entry| {
            let value = change(&entry.value)?;
            let restore = if entry.state().modified() {
                None
            } else {
                entry.set_cached_dirty()?;
                Some(entry.value.clone())
            };
            entry.value = value;
            Ok(restore)
        })?;
        if let Some(restore) = restore {
            self.modified_objects.push(SavedObject {
                oid,
                restore,
                created: false,
            });
        }
        Ok(())
    }

    /// Runs `f` on the object's entry once it is readable, or writable if `for_update`,
    /// fetching or upgrading it first as needed.
    fn with_object<T>(
        &mut self,
        oid: ObjectId,
        for_update: bool,
        f: impl FnOnce(&mut Entry<ObjectValue>) -> Result<T>,
    ) -> Result<T> {
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        let key = DataKey::Object(oid);
        for _ in 0..MAX_RETRIES {
            shared.check()?;
            let waiter = self.waiter(&shared);
            let mut bucket = store.cache.lock_object(oid);
            let Some(serial) = bucket.current_object(oid).map(|entry| entry.serial()) else {
                drop(bucket);
                self.fetch_object(oid, for_update)?;
                continue;
            };
            let ready = if for_update {
                match bucket.await_writable(&key, serial, &waiter)? {
                    AwaitWritable::Writable => true,
                    AwaitWritable::Readable => {
                        bucket.object_mut(oid, serial)?.set_fetching_upgrade()?;
                        drop(bucket);
                        submit_fetch(&store, &shared, oid, serial, Fetch::Upgrade)?;
                        continue;
                    }
                    AwaitWritable::Decached => false,
                }
            } else {
                bucket.await_readable(&key, serial, &waiter)?
            };
            if !ready {
                continue;
            }
            let entry = bucket.object_mut(oid, serial)?;
            entry.note_access(self.context_id);
            return f(entry);
        }
        Err(Error::ResourceExhausted(format!(
            "too many retries waiting for object {oid}"
        )))
    }

    /// Adds a fetching entry for an object that is not cached and starts fetching it.
    fn fetch_object(&self, oid: ObjectId, for_update: bool) -> Result<()> {
        let store = &self.store;
        let mut reservation = store.cache.reservations().reserve(1, Some(self.deadline()))?;
        let mut bucket = store.cache.lock_object(oid);
        if bucket.current_object(oid).is_some() {
            return Ok(());
        }
        let (state, fetch) = if for_update {
            (State::FetchingWrite, Fetch::Write)
        } else {
            (State::FetchingRead, Fetch::Read)
        };
        let serial = bucket.add_object(oid, state, self.context_id, ObjectValue::Removed, &mut reservation)?;
        drop(bucket);
        submit_fetch(store, &self.shared, oid, serial, fetch)
    }
}

fn data_of(oid: ObjectId, entry: &Entry<ObjectValue>) -> Result<Bytes> {
    match &entry.value {
        ObjectValue::Data(data) => Ok(data.clone()),
        ObjectValue::New | ObjectValue::Removed => Err(Error::ObjectNotFound(oid)),
    }
}

/// Runs a fetch on the fetch pool. If it fails, the failure goes to the transaction
/// and the entry goes back to how it was.
fn submit_fetch(
    store: &Arc<StoreInner>,
    shared: &Arc<TxnShared>,
    oid: ObjectId,
    serial: u64,
    fetch: Fetch,
) -> Result<()> {
    let job_store = Arc::clone(store);
    let job_shared = Arc::clone(shared);
    let submitted = store.fetch_pool.execute(move || {
        if let Err(e) = fetch_object(&job_store, oid, serial, fetch) {
            debug!(%oid, ?fetch, %e, "fetch failed");
            job_store.report_if_fatal(&e);
            job_shared.fail(e);
            abandon_fetch(&job_store, oid, serial, fetch);
        }
    });
    if let Err(e) = submitted {
        abandon_fetch(store, oid, serial, fetch);
        return Err(e);
    }
    Ok(())
}

fn fetch_object(store: &Arc<StoreInner>, oid: ObjectId, serial: u64, fetch: Fetch) -> Result<()> {
    let server = &store.server;
    let node_id = store.node_id;
    let retry = store.config.retry;
    let (value, evict, downgrade) = match fetch {
        Fetch::Read => match retry.run("get_object", || server.get_object(node_id, oid))? {
            Some(found) => (Some(ObjectValue::Data(found.data)), found.callback_evict, false),
            None => (Some(ObjectValue::Removed), false, false),
        },
        Fetch::Write => {
            match retry.run("get_object_for_update", || server.get_object_for_update(node_id, oid))? {
                Some(found) => (
                    Some(ObjectValue::Data(found.data)),
                    found.callback_evict,
                    found.callback_downgrade,
                ),
                None => (Some(ObjectValue::Removed), false, false),
            }
        }
        Fetch::Upgrade => {
            let upgraded = retry.run("upgrade_object", || server.upgrade_object(node_id, oid))?;
            (None, upgraded.callback_evict, upgraded.callback_downgrade)
        }
    };
    {
        let mut bucket = store.cache.lock_object(oid);
        let entry = bucket.object_mut(oid, serial)?;
        if let Some(value) = value {
            entry.value = value;
        }
        match fetch {
            Fetch::Read => entry.set_cached_read()?,
            Fetch::Write => entry.set_cached_write()?,
            Fetch::Upgrade => entry.set_upgraded()?,
        }
        trace!(%oid, ?fetch, state = ?entry.state(), "fetched object");
    }
    store.follow_up(DataKey::Object(oid), evict, downgrade);
    Ok(())
}

fn abandon_fetch(store: &StoreInner, oid: ObjectId, serial: u64, fetch: Fetch) {
    let abandon = || -> Result<()> {
        let mut bucket = store.cache.lock_object(oid);
        let entry = bucket.object_mut(oid, serial)?;
        if fetch == Fetch::Upgrade {
            entry.abandon_upgrade()
        } else {
            entry.set_evicted_abandon_fetching()?;
            bucket.remove_object(oid, serial)
        }
    };
    if let Err(e) = abandon() {
        warn!(%oid, ?fetch, %e, "cannot abandon fetch");
        store.report_if_fatal(&e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachestore_id::ContextId;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_data_is_readable() {
        let oid = ObjectId::new(9).unwrap();
        let entry = |value| Entry::new(1, State::CachedRead, ContextId::NONE, value);
        assert_eq!(
            data_of(oid, &entry(ObjectValue::Data(Bytes::from_static(b"abc")))).unwrap(),
            Bytes::from_static(b"abc")
        );
        assert_eq!(data_of(oid, &entry(ObjectValue::New)).unwrap_err(), Error::ObjectNotFound(oid));
        assert_eq!(
            data_of(oid, &entry(ObjectValue::Removed)).unwrap_err(),
            Error::ObjectNotFound(oid)
        );
    }
}
