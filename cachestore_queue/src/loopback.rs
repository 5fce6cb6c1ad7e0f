use crate::{
    OnFailure, QueuedRequest, RequestQueue, RequestQueueConfig,
    sequence::RequestNumber,
    server::{Handled, RequestQueueServer},
};
use cachestore_api::{Error, FailureReporter, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

/// A request queue for a node that shares a process with the server. Requests are
/// numbered and handed to the node's [`RequestQueueServer`] on a dedicated thread.
///
/// A request the server could not perform yet, because a lock timed out or deadlocked,
/// is performed again after [`RequestQueueConfig::retry_wait`]. Once the queue is shutting
/// down, it stops trying after [`RequestQueueConfig::max_retry`].
#[derive(Debug)]
pub struct LoopbackRequestQueue {
    sender: Mutex<Option<Sender<QueuedRequest>>>,
    stopping: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackRequestQueue {
    pub fn new(
        server: Arc<RequestQueueServer>,
        config: RequestQueueConfig,
        reporter: Arc<dyn FailureReporter>,
    ) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = crossbeam_channel::bounded(config.queue_size);
        let node_id = server.node_id();
        let stopping = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            server,
            reporter,
            retry_wait: config.retry_wait,
            max_retry: config.max_retry,
            stopping: Arc::clone(&stopping),
        };
        let worker = std::thread::Builder::new()
            .name(format!("update-queue-{node_id}"))
            .spawn(move || worker.run(receiver))
            .map_err(|e| Error::IllegalState(format!("cannot start update queue thread: {e}")))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            stopping,
            worker: Mutex::new(Some(worker)),
        })
    }
}

struct Worker {
    server: Arc<RequestQueueServer>,
    reporter: Arc<dyn FailureReporter>,
    retry_wait: Duration,
    max_retry: Duration,
    stopping: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, receiver: Receiver<QueuedRequest>) {
        let node_id = self.server.node_id();
        let mut number = RequestNumber::ZERO;
        for queued in receiver {
            if !self.perform(number, &queued) {
                return;
            }
            queued.complete();
            number = number.next();
        }
        debug!(%node_id, "update queue drained");
    }

    /// Returns whether the request was performed.
    fn perform(&self, number: RequestNumber, queued: &QueuedRequest) -> bool {
        let node_id = self.server.node_id();
        let started = Instant::now();
        loop {
            let e = match self.server.handle(number, &queued.request) {
                Ok(Handled::Performed(Ok(()))) | Ok(Handled::Duplicate) => return true,
                Ok(Handled::Performed(Err(e))) => e,
                Err(e) => Error::IllegalState(e.to_string()),
            };
            match OnFailure::for_error(&e) {
                OnFailure::Resend
                    if !self.stopping.load(Ordering::Acquire)
                        || started.elapsed() < self.max_retry =>
                {
                    debug!(%node_id, request = %queued.request, %e, "resending update request");
                    std::thread::sleep(self.retry_wait);
                }
                OnFailure::Resend | OnFailure::Stop => {
                    info!(%node_id, request = %queued.request, %e, "update queue stopped");
                    return false;
                }
                OnFailure::Report => {
                    error!(%node_id, request = %queued.request, %e, "update queue failed");
                    self.reporter.report_failure(&e);
                    return false;
                }
            }
        }
    }
}

impl RequestQueue for LoopbackRequestQueue {
    fn add_request(&self, request: QueuedRequest) -> Result<()> {
        let sender = self.sender.lock().clone().ok_or(Error::ShuttingDown)?;
        sender.send(request).map_err(|_| Error::ShuttingDown)
    }

    fn shutdown(&self) {
        self.sender.lock().take();
        self.stopping.store(true, Ordering::Release);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != std::thread::current().id() && worker.join().is_err() {
                error!("update queue thread panicked");
            }
        }
    }
}
