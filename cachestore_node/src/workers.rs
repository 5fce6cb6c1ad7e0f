use cachestore_api::{Error, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::thread::JoinHandle;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of named threads running jobs in the order they are submitted.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    name: &'static str,
    sender: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(name: &'static str, threads: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let handles = (0..threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        for job in receiver {
                            job();
                        }
                    })
                    .map_err(|e| Error::IllegalState(format!("cannot start {name} thread: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(handles),
        })
    }

    /// Queues a job. Fails once the pool has shut down.
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(Error::ShuttingDown);
        };
        sender.send(Box::new(job)).map_err(|_| Error::ShuttingDown)
    }

    /// Stops taking jobs and waits for the queued ones to finish.
    pub(crate) fn shutdown(&self) {
        drop(self.sender.lock().take());
        let threads = std::mem::take(&mut *self.threads.lock());
        let current = std::thread::current().id();
        for handle in threads {
            // A job that shuts the store down cannot wait for its own thread
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = self.name, "worker thread panicked");
            }
        }
        debug!(pool = self.name, "worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn runs_queued_jobs_before_stopping() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let count = Arc::clone(&count);
            pool.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 20);
        assert_eq!(pool.execute(|| {}).unwrap_err(), Error::ShuttingDown);
    }
}
