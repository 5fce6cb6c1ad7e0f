//! Where the store is between starting and shutting down, and whether it has failed.

use cachestore_api::{Error, FailureReporter, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum State {
    NotReady,
    Ready,
    ShutdownRequested,
    ShutdownTxnsCompleted,
    ShutdownCompleted,
}

#[derive(Debug)]
struct Status {
    state: State,
    txn_count: usize,
    failure: Option<Error>,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    status: Mutex<Status>,
    changed: Condvar,
    reporters: Mutex<Vec<Arc<dyn FailureReporter>>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(Status {
                state: State::NotReady,
                txn_count: 0,
                failure: None,
            }),
            changed: Condvar::new(),
            reporters: Mutex::new(vec![]),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.status.lock().state
    }

    pub(crate) fn add_reporter(&self, reporter: Arc<dyn FailureReporter>) {
        self.reporters.lock().push(reporter);
    }

    /// Marks the store ready, unless it already failed.
    pub(crate) fn ready(&self) -> Result<()> {
        let mut status = self.status.lock();
        if let Some(failure) = &status.failure {
            return Err(Error::NodeFailed(failure.to_string()));
        }
        if status.state == State::NotReady {
            status.state = State::Ready;
        }
        Ok(())
    }

    pub(crate) fn txn_started(&self) -> Result<()> {
        let mut status = self.status.lock();
        if let Some(failure) = &status.failure {
            return Err(Error::NodeFailed(failure.to_string()));
        }
        if status.state >= State::ShutdownRequested {
            return Err(Error::ShuttingDown);
        }
        status.txn_count += 1;
        Ok(())
    }

    pub(crate) fn txn_finished(&self) {
        let mut status = self.status.lock();
        status.txn_count = status.txn_count.saturating_sub(1);
        if status.txn_count == 0 {
            self.changed.notify_all();
        }
    }

    /// Requests shutdown and waits for running transactions to finish. Returns `false`
    /// if another caller is already shutting the store down, after waiting for it to
    /// complete.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let mut status = self.status.lock();
        if status.state >= State::ShutdownRequested {
            while status.state != State::ShutdownCompleted {
                self.changed.wait(&mut status);
            }
            return false;
        }
        status.state = State::ShutdownRequested;
        info!(txn_count = status.txn_count, "shutdown requested");
        while status.txn_count > 0 {
            self.changed.wait(&mut status);
        }
        status.state = State::ShutdownTxnsCompleted;
        self.changed.notify_all();
        true
    }

    pub(crate) fn shutdown_completed(&self) {
        self.status.lock().state = State::ShutdownCompleted;
        self.changed.notify_all();
        info!("shutdown completed");
    }
}

impl FailureReporter for Lifecycle {
    fn report_failure(&self, e: &Error) {
        {
            let mut status = self.status.lock();
            if status.failure.is_some() {
                return;
            }
            error!(%e, "cache node failed");
            status.failure = Some(e.clone());
        }
        let reporters = self.reporters.lock().clone();
        for reporter in reporters {
            reporter.report_failure(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{thread, time::Duration};

    #[test]
    fn shutdown_waits_for_transactions() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.ready().unwrap();
        lifecycle.txn_started().unwrap();
        let shutdown = {
            let lifecycle = Arc::clone(&lifecycle);
            thread::spawn(move || lifecycle.begin_shutdown())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(lifecycle.state(), State::ShutdownRequested);
        assert_eq!(lifecycle.txn_started().unwrap_err(), Error::ShuttingDown);
        lifecycle.txn_finished();
        assert!(shutdown.join().unwrap());
        assert_eq!(lifecycle.state(), State::ShutdownTxnsCompleted);

        let second = {
            let lifecycle = Arc::clone(&lifecycle);
            thread::spawn(move || lifecycle.begin_shutdown())
        };
        thread::sleep(Duration::from_millis(20));
        lifecycle.shutdown_completed();
        assert!(!second.join().unwrap());
    }

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<Error>>);

    impl FailureReporter for Recorder {
        fn report_failure(&self, error: &Error) {
            self.0.lock().push(error.clone());
        }
    }

    #[test]
    fn failure_is_reported_once() {
        let lifecycle = Lifecycle::new();
        let recorder = Arc::new(Recorder::default());
        lifecycle.add_reporter(Arc::clone(&recorder) as Arc<dyn FailureReporter>);
        lifecycle.report_failure(&Error::Network("gone".to_string()));
        lifecycle.report_failure(&Error::IllegalState("later".to_string()));
        assert_eq!(*recorder.0.lock(), vec![Error::Network("gone".to_string())]);
        assert!(matches!(lifecycle.txn_started(), Err(Error::NodeFailed(_))));
        assert!(matches!(lifecycle.ready(), Err(Error::NodeFailed(_))));
    }
}
