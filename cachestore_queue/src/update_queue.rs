use crate::{Completion, QueuedRequest, RequestQueue};
use cachestore_api::{CommitRequest, Error, Result, UpdateRequest};
use cachestore_id::{BindingKey, ContextId, ObjectId};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, trace};

/// The node side of the update queue.
///
/// Every transaction gets a context id when it starts. Requests tied to a transaction
/// are held back while any transaction with a lower context id is still running, and
/// are sent once all of those have finished, so the server sees them after the commits
/// they may depend on. Commits themselves are limited to `update_queue_size`
/// outstanding at a time.
#[derive(Debug)]
pub struct UpdateQueue {
    queue: Arc<dyn RequestQueue>,
    commit_slots: Arc<CommitSlots>,
    pending: Mutex<PendingSubmit>,
    pending_acknowledge: Arc<PendingAcknowledge>,
}

/// Commits sent but not yet acknowledged.
#[derive(Debug, Default)]
struct PendingAcknowledge {
    commits: Mutex<BTreeSet<ContextId>>,
    acknowledged: Condvar,
}

#[derive(Debug, Default)]
struct PendingSubmit {
    last_context_id: u64,
    transactions: BTreeMap<ContextId, PendingTxn>,
}

#[derive(Debug, Default)]
struct PendingTxn {
    finished: bool,
    requests: Vec<QueuedRequest>,
}

impl UpdateQueue {
    pub fn new(queue: Arc<dyn RequestQueue>, update_queue_size: usize) -> Result<Self> {
        if update_queue_size < 1 {
            return Err(Error::InvalidArgument(
                "update queue size must not be less than 1".to_string(),
            ));
        }
        Ok(Self {
            queue,
            commit_slots: Arc::new(CommitSlots::new(update_queue_size)),
            pending: Mutex::new(PendingSubmit::default()),
            pending_acknowledge: Arc::new(PendingAcknowledge::default()),
        })
    }

    /// Assigns the next context id to a starting transaction.
    pub fn begin_txn(&self) -> ContextId {
        let mut pending = self.pending.lock();
        pending.last_context_id += 1;
        let context_id = ContextId::from(pending.last_context_id);
        pending.transactions.insert(context_id, PendingTxn::default());
        trace!(%context_id, "transaction started");
        context_id
    }

    /// Reserves room for the transaction's commit, waiting until `deadline`.
    pub fn prepare(&self, deadline: Instant) -> Result<()> {
        if Instant::now() >= deadline {
            return Err(Error::Timeout(
                "transaction timed out before prepare".to_string(),
            ));
        }
        if self.commit_slots.acquire_until(deadline) {
            Ok(())
        } else {
            Err(Error::ResourceExhausted("update queue full".to_string()))
        }
    }

    /// Sends the changes of a prepared transaction. Its slot is freed once the server
    /// acknowledges the commit.
    pub fn commit(&self, context_id: ContextId, commit: CommitRequest) -> Result<()> {
        debug!(%context_id, oids = commit.oids.len(), names = commit.names.len(), "commit");
        self.pending_acknowledge.commits.lock().insert(context_id);
        let pending_acknowledge = Arc::clone(&self.pending_acknowledge);
        let commit_slots = Arc::clone(&self.commit_slots);
        let completion: Completion = Box::new(move || {
            pending_acknowledge.commits.lock().remove(&context_id);
            pending_acknowledge.acknowledged.notify_all();
            commit_slots.release();
        });

        let mut pending = self.pending.lock();
        if let Err(e) = self.txn_finished(&mut pending, context_id) {
            self.pending_acknowledge.commits.lock().remove(&context_id);
            return Err(e);
        }
        self.queue.add_request(QueuedRequest::with_completion(
            UpdateRequest::Commit(commit),
            completion,
        ))
    }

    pub fn abort(&self, context_id: ContextId, prepared: bool) -> Result<()> {
        trace!(%context_id, prepared, "abort");
        if prepared {
            self.commit_slots.release();
        }
        let mut pending = self.pending.lock();
        self.txn_finished(&mut pending, context_id)
    }

    pub fn evict_object(
        &self,
        context_id: ContextId,
        oid: ObjectId,
        completion: Completion,
    ) -> Result<()> {
        self.add_request(context_id, UpdateRequest::EvictObject(oid), completion)
    }

    pub fn downgrade_object(
        &self,
        context_id: ContextId,
        oid: ObjectId,
        completion: Completion,
    ) -> Result<()> {
        self.add_request(context_id, UpdateRequest::DowngradeObject(oid), completion)
    }

    pub fn evict_binding(
        &self,
        context_id: ContextId,
        key: BindingKey,
        completion: Completion,
    ) -> Result<()> {
        self.add_request(context_id, UpdateRequest::EvictBinding(key), completion)
    }

    pub fn downgrade_binding(
        &self,
        context_id: ContextId,
        key: BindingKey,
        completion: Completion,
    ) -> Result<()> {
        self.add_request(context_id, UpdateRequest::DowngradeBinding(key), completion)
    }

    /// The lowest context id of a transaction that is still running or whose commit has
    /// not been acknowledged, or the id the next transaction will get if there is none.
    /// Entries used by a transaction at or after this one are in use.
    pub fn lowest_pending_context_id(&self) -> ContextId {
        let (submit, next) = {
            let pending = self.pending.lock();
            (
                pending.transactions.keys().next().copied(),
                ContextId::from(pending.last_context_id + 1),
            )
        };
        let acknowledge = self.pending_acknowledge.commits.lock().first().copied();
        submit.into_iter().chain(acknowledge).min().unwrap_or(next)
    }

    /// Waits until the server has acknowledged every commit sent so far. Returns `false`
    /// if `deadline` passes first.
    pub fn await_commits(&self, deadline: Instant) -> bool {
        let mut commits = self.pending_acknowledge.commits.lock();
        while !commits.is_empty() {
            if self
                .pending_acknowledge
                .acknowledged
                .wait_until(&mut commits, deadline)
                .timed_out()
            {
                return commits.is_empty();
            }
        }
        true
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    fn add_request(
        &self,
        context_id: ContextId,
        request: UpdateRequest,
        completion: Completion,
    ) -> Result<()> {
        let request = QueuedRequest::with_completion(request, completion);
        let mut pending = self.pending.lock();
        match pending.transactions.get_mut(&context_id) {
            Some(txn) => {
                trace!(%context_id, request = %request.request, "holding request");
                txn.requests.push(request);
                Ok(())
            }
            None => self.queue.add_request(request),
        }
    }

    /// Marks the transaction finished, then sends the held requests of every finished
    /// transaction that no longer has a running one before it.
    fn txn_finished(&self, pending: &mut PendingSubmit, context_id: ContextId) -> Result<()> {
        let Some(txn) = pending.transactions.get_mut(&context_id) else {
            return Err(Error::IllegalState(format!(
                "transaction {context_id} is not pending"
            )));
        };
        txn.finished = true;
        while let Some(first) = pending.transactions.first_entry() {
            if !first.get().finished {
                break;
            }
            let (first_id, txn) = first.remove_entry();
            if !txn.requests.is_empty() {
                debug!(context_id = %first_id, count = txn.requests.len(), "releasing held requests");
            }
            for request in txn.requests {
                self.queue.add_request(request)?;
            }
        }
        Ok(())
    }
}

/// A counting semaphore with deadline-bounded acquisition.
#[derive(Debug)]
struct CommitSlots {
    capacity: usize,
    available: Mutex<usize>,
    cond: Condvar,
}

impl CommitSlots {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
            cond: Condvar::new(),
        }
    }

    fn acquire_until(&self, deadline: Instant) -> bool {
        let mut available = self.available.lock();
        while *available == 0 {
            if self.cond.wait_until(&mut available, deadline).timed_out() && *available == 0 {
                return false;
            }
        }
        *available -= 1;
        true
    }

    fn release(&self) {
        let mut available = self.available.lock();
        if *available < self.capacity {
            *available += 1;
        }
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    /// Records requests and acknowledges them when told to.
    #[derive(Debug, Default)]
    struct ManualQueue {
        requests: Mutex<Vec<QueuedRequest>>,
    }

    impl ManualQueue {
        fn sent(&self) -> Vec<String> {
            self.requests
                .lock()
                .iter()
                .map(|r| r.request.to_string())
                .collect()
        }

        fn acknowledge_all(&self) {
            let requests = std::mem::take(&mut *self.requests.lock());
            for request in requests {
                request.complete();
            }
        }
    }

    impl RequestQueue for ManualQueue {
        fn add_request(&self, request: QueuedRequest) -> Result<()> {
            self.requests.lock().push(request);
            Ok(())
        }

        fn shutdown(&self) {}
    }

    fn oid(value: u64) -> ObjectId {
        ObjectId::new(value).unwrap()
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test_log::test]
    fn context_ids_increase() {
        let queue = UpdateQueue::new(Arc::new(ManualQueue::default()), 2).unwrap();
        let a = queue.begin_txn();
        let b = queue.begin_txn();
        assert!(a < b);
        assert!(a > ContextId::NONE);
        assert_eq!(queue.lowest_pending_context_id(), a);
        queue.abort(a, false).unwrap();
        assert_eq!(queue.lowest_pending_context_id(), b);
        queue.abort(b, false).unwrap();
        let next = queue.lowest_pending_context_id();
        assert!(next > b);
        assert_eq!(queue.begin_txn(), next);
    }

    #[test_log::test]
    fn requests_wait_for_earlier_transactions() {
        let transport = Arc::new(ManualQueue::default());
        let queue = UpdateQueue::new(Arc::clone(&transport) as _, 4).unwrap();
        let t1 = queue.begin_txn();
        let t2 = queue.begin_txn();
        let t3 = queue.begin_txn();

        queue.evict_object(t2, oid(2), Box::new(|| {})).unwrap();
        queue.evict_object(t3, oid(3), Box::new(|| {})).unwrap();
        assert!(transport.sent().is_empty());

        // t3 finishing first releases nothing: t1 is still running.
        queue.prepare(soon()).unwrap();
        queue.commit(t3, CommitRequest::default()).unwrap();
        assert_eq!(transport.sent(), vec!["commit(0 objects, 0 names)"]);

        queue.abort(t2, false).unwrap();
        assert_eq!(transport.sent().len(), 1);

        // t1 finishing releases t2 and t3 in order.
        queue.abort(t1, false).unwrap();
        assert_eq!(
            transport.sent(),
            vec![
                "commit(0 objects, 0 names)",
                "evict object 2",
                "evict object 3"
            ]
        );

        // With nothing pending, requests go straight out.
        queue.downgrade_object(t1, oid(1), Box::new(|| {})).unwrap();
        assert_eq!(transport.sent().last().unwrap(), "downgrade object 1");
    }

    #[test_log::test]
    fn commit_slots_limit_outstanding_commits() {
        let transport = Arc::new(ManualQueue::default());
        let queue = UpdateQueue::new(Arc::clone(&transport) as _, 1).unwrap();

        let t1 = queue.begin_txn();
        queue.prepare(soon()).unwrap();
        queue.commit(t1, CommitRequest::default()).unwrap();
        assert_eq!(queue.lowest_pending_context_id(), t1);

        let t2 = queue.begin_txn();
        let err = queue.prepare(soon()).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)), "{err}");

        assert!(!queue.await_commits(Instant::now() + Duration::from_millis(10)));
        transport.acknowledge_all();
        assert!(queue.await_commits(soon()));
        assert_eq!(queue.lowest_pending_context_id(), t2);
        queue.prepare(soon()).unwrap();
        queue.abort(t2, true).unwrap();

        let t3 = queue.begin_txn();
        let err = queue.prepare(Instant::now()).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err}");
        queue.prepare(soon()).unwrap();
        queue.abort(t3, true).unwrap();
    }

    #[test]
    fn finishing_unknown_transaction_fails() {
        let queue = UpdateQueue::new(Arc::new(ManualQueue::default()), 1).unwrap();
        let err = queue.abort(ContextId::from(7), false).unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        assert!(UpdateQueue::new(Arc::new(ManualQueue::default()), 0).is_err());
    }
}
