use cachestore_api::{Error, Result};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::{sync::Arc, time::Instant};
use tracing::{debug, trace};

/// Counts the cache entries that may still be created.
///
/// Space must be reserved before an entry's bucket is locked: the evictor locks buckets
/// while it frees space.
#[derive(Debug)]
pub(crate) struct Reservations {
    size: usize,
    state: Mutex<ReserveState>,
    cond: Condvar,
    /// Told, without blocking, whenever a caller has to wait for space.
    cache_full: Sender<()>,
}

#[derive(Debug)]
struct ReserveState {
    available: usize,
    shutdown: bool,
}

impl Reservations {
    pub(crate) fn new(size: usize, cache_full: Sender<()>) -> Self {
        Self {
            size,
            state: Mutex::new(ReserveState {
                available: size,
                shutdown: false,
            }),
            cond: Condvar::new(),
            cache_full,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Reserves `count` entries, waiting for space until `deadline`, or for as long as it
    /// takes if there is none.
    pub(crate) fn reserve(
        self: &Arc<Self>,
        count: usize,
        deadline: Option<Instant>,
    ) -> Result<Reservation> {
        if count > self.size {
            return Err(Error::InvalidArgument(format!(
                "cannot reserve {count} entries in a cache of size {}",
                self.size
            )));
        }
        let mut state = self.state.lock();
        let mut notified = false;
        while state.available < count {
            if state.shutdown {
                return Err(Error::ShuttingDown);
            }
            if !notified {
                debug!(count, available = state.available, "cache full");
                let _ = self.cache_full.try_send(());
                notified = true;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && state.available < count
                    {
                        return Err(Error::Timeout(format!(
                            "waiting to reserve {count} cache entries"
                        )));
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        state.available -= count;
        trace!(count, available = state.available, "reserved");
        Ok(Reservation {
            reservations: Arc::clone(self),
            count,
        })
    }

    /// Reserves `count` entries only if they are available now.
    pub(crate) fn try_reserve(&self, count: usize) -> bool {
        let mut state = self.state.lock();
        if state.available < count {
            return false;
        }
        state.available -= count;
        true
    }

    pub(crate) fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.available = (state.available + count).min(self.size);
        self.cond.notify_all();
    }

    /// Fails current and future waits for space.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }
}

/// Reserved space for new entries. Whatever is not used is given back on drop.
#[derive(Debug)]
pub(crate) struct Reservation {
    reservations: Arc<Reservations>,
    count: usize,
}

impl Reservation {
    pub(crate) fn count(&self) -> usize {
        self.count
    }

    /// Uses one entry's worth of space for an entry added to the cache.
    pub(crate) fn take_one(&mut self) -> Result<()> {
        if self.count == 0 {
            return Err(Error::IllegalState(
                "adding a cache entry without a reservation".to_string(),
            ));
        }
        self.count -= 1;
        Ok(())
    }

    /// Moves up to `count` entries of space into a new reservation.
    pub(crate) fn split(&mut self, count: usize) -> Self {
        let count = count.min(self.count);
        self.count -= count;
        Self {
            reservations: Arc::clone(&self.reservations),
            count,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reservations.release(self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{thread, time::Duration};

    fn reservations(size: usize) -> (Arc<Reservations>, crossbeam_channel::Receiver<()>) {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        (Arc::new(Reservations::new(size, sender)), receiver)
    }

    #[test]
    fn used_plus_available_is_size() {
        let (reservations, _full) = reservations(10);
        let mut a = reservations.reserve(4, None).unwrap();
        assert_eq!(reservations.available(), 6);
        a.take_one().unwrap();
        let b = a.split(2);
        assert_eq!((a.count(), b.count()), (1, 2));
        drop(a);
        assert_eq!(reservations.available(), 7);
        drop(b);
        // The entry that was added still holds its space
        assert_eq!(reservations.available(), 9);
        reservations.release(1);
        assert_eq!(reservations.available(), 10);
        reservations.release(5);
        assert_eq!(reservations.available(), 10);
    }

    #[test]
    fn empty_reservation_cannot_add() {
        let (reservations, _full) = reservations(10);
        let mut reservation = reservations.reserve(1, None).unwrap();
        reservation.take_one().unwrap();
        assert!(matches!(reservation.take_one(), Err(Error::IllegalState(_))));
        assert!(matches!(
            reservations.reserve(11, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn full_cache_notifies_and_times_out() {
        let (reservations, full) = reservations(2);
        assert!(reservations.try_reserve(2));
        assert!(!reservations.try_reserve(1));
        let err = reservations
            .reserve(1, Some(Instant::now() + Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err}");
        full.try_recv().unwrap();
    }

    #[test]
    fn waiter_gets_released_space() {
        let (reservations, full) = reservations(1);
        assert!(reservations.try_reserve(1));
        let waiter = {
            let reservations = Arc::clone(&reservations);
            thread::spawn(move || reservations.reserve(1, None).map(|r| r.count()))
        };
        full.recv_timeout(Duration::from_secs(5)).unwrap();
        reservations.release(1);
        assert_eq!(waiter.join().unwrap().unwrap(), 1);
        assert_eq!(reservations.available(), 1);
    }

    #[test]
    fn shutdown_fails_waiters() {
        let (reservations, full) = reservations(1);
        assert!(reservations.try_reserve(1));
        let waiter = {
            let reservations = Arc::clone(&reservations);
            thread::spawn(move || reservations.reserve(1, None).map(|r| r.count()))
        };
        full.recv_timeout(Duration::from_secs(5)).unwrap();
        reservations.shutdown();
        assert_eq!(waiter.join().unwrap().unwrap_err(), Error::ShuttingDown);
    }
}
