//! The evictor thread.
//!
//! While the cache has room, the evictor holds a reserve of space. When someone has to
//! wait for space it gives the reserve up, then evicts entries until it can take the
//! reserve again. Candidates come from a scan of a batch of entries; entries no
//! transaction is using go first, then read-only ones, then those used longest ago.

use crate::{
    entry::{State, Step},
    store::StoreInner,
};
use cachestore_api::{DataKey, Result};
use cachestore_id::ContextId;
use crossbeam_channel::{Receiver, select};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub(crate) fn run_evictor(store: &Arc<StoreInner>, cache_full: &Receiver<()>, stop: &Receiver<()>) {
    let reserve = store.config.eviction_reserve_size;
    let reservations = store.cache.reservations();
    let pause = store.config.retry.retry_wait;
    let mut reserved = reservations.try_reserve(reserve);
    let mut cursor = 0;
    debug!(node_id = %store.node_id, reserve, "evictor started");
    loop {
        if reserved {
            select! {
                recv(cache_full) -> _ => {}
                recv(stop) -> _ => break,
            }
            trace!(reserve, "cache full, giving up reserve");
            reservations.release(reserve);
            reserved = false;
            continue;
        }
        if reservations.available() >= reserve * 2 {
            reserved = reservations.try_reserve(reserve);
            continue;
        }
        let mut started = 0;
        for _ in 0..reserve {
            match evict_one(store, &mut cursor) {
                Ok(true) => started += 1,
                Ok(false) => break,
                Err(e) => {
                    warn!(%e, "eviction failed");
                    store.report_if_fatal(&e);
                    break;
                }
            }
        }
        trace!(started, available = reservations.available(), "eviction round");
        // Let evictions be acknowledged before looking again
        select! {
            recv(stop) -> _ => break,
            default(pause) => {}
        }
    }
    if reserved {
        reservations.release(reserve);
    }
    debug!(node_id = %store.node_id, "evictor stopped");
}

/// Picks an entry from the next batch and starts evicting it. Returns `false` if the
/// batch had nothing to evict.
fn evict_one(store: &Arc<StoreInner>, cursor: &mut usize) -> Result<bool> {
    let lowest_pending = store.update_queue.lowest_pending_context_id();
    let mut best: Option<((bool, bool, ContextId), DataKey, u64)> = None;
    for (key, serial) in store.cache.scan_keys(cursor, store.config.eviction_batch_size) {
        let bucket = store.cache.lock_key(&key);
        let Some(entry) = bucket.summary(&key).filter(|entry| entry.serial == serial) else {
            continue;
        };
        // Entries on their way in or out, and modified ones, stay
        if !matches!(entry.state, State::CachedRead | State::CachedWrite) {
            continue;
        }
        let rank = (
            entry.in_use(lowest_pending),
            entry.state == State::CachedWrite,
            entry.context_id,
        );
        if best.as_ref().is_none_or(|(best_rank, ..)| rank < *best_rank) {
            best = Some((rank, key, serial));
        }
    }
    let Some((_, key, serial)) = best else {
        return Ok(false);
    };

    let mut bucket = store.cache.lock_key(&key);
    let Some(entry) = bucket.summary(&key).filter(|entry| entry.serial == serial) else {
        return Ok(true);
    };
    if entry.in_use(lowest_pending) || !matches!(entry.state, State::CachedRead | State::CachedWrite)
    {
        drop(bucket);
        trace!(%key, "entry in use, evicting later");
        store.schedule_task(key, true)?;
        return Ok(true);
    }
    let context_id = bucket.step(&key, serial, Step::Evicting)?;
    drop(bucket);
    trace!(%key, "evicting");
    store.send_release(&key, serial, context_id, true)?;
    Ok(true)
}
