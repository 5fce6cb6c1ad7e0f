//! The ordered, retried stream of requests a node sends to the caching server: commits of
//! finished transactions and acknowledgements that locks were given up.
//!
//! Requests are numbered and kept until the server acknowledges them, so that a client
//! that loses its connection can resend them on a new one. The server performs each
//! numbered request once, acknowledging duplicates without repeating them. On top of that
//! transport, [`UpdateQueue`] holds back requests that belong to a transaction until
//! every earlier transaction on the node has finished, so the server sees changes in
//! transaction order.

use cachestore_api::{Error, Result, UpdateRequest};
use std::{fmt::Debug, time::Duration};

mod client;
pub mod codec;
mod listener;
mod loopback;
pub mod sequence;
mod server;
mod update_queue;

pub use client::RequestQueueClient;
pub use listener::{NodeQueues, RequestQueueListener};
pub use loopback::LoopbackRequestQueue;
pub use sequence::{MAX_OUTSTANDING, RequestNumber, earlier_request};
pub use server::{Handled, RequestQueueServer};
pub use update_queue::UpdateQueue;

/// Run once the server has acknowledged a request.
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// A request waiting to be sent, with what to do once it is acknowledged.
pub struct QueuedRequest {
    pub request: UpdateRequest,
    pub completion: Option<Completion>,
}

impl QueuedRequest {
    pub fn new(request: UpdateRequest) -> Self {
        Self {
            request,
            completion: None,
        }
    }

    pub fn with_completion(request: UpdateRequest, completion: Completion) -> Self {
        Self {
            request,
            completion: Some(completion),
        }
    }

    pub(crate) fn complete(self) {
        if let Some(completion) = self.completion {
            completion();
        }
    }
}

impl Debug for QueuedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("request", &self.request)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

/// What a queue does after the server fails one of its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnFailure {
    /// Send the request again after a pause.
    Resend,
    /// The server is going away. Stop without reporting the node as failed.
    Stop,
    /// Stop and report the node as failed.
    Report,
}

impl OnFailure {
    pub(crate) fn for_error(error: &Error) -> Self {
        if error.should_retry() {
            Self::Resend
        } else if matches!(error, Error::ShuttingDown | Error::Interrupted(_)) {
            Self::Stop
        } else {
            Self::Report
        }
    }
}

/// Carries requests to the server in the order they are added.
pub trait RequestQueue: Debug + Send + Sync + 'static {
    /// Adds a request, blocking while the queue is full. Fails once the queue has shut
    /// down.
    fn add_request(&self, request: QueuedRequest) -> Result<()>;

    /// Stops accepting requests, sends the ones already added, and waits for them to be
    /// acknowledged or for the queue to fail.
    fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestQueueConfig {
    /// How many requests may be waiting to be sent or acknowledged.
    pub queue_size: usize,
    /// How long to keep reconnecting after a network failure before giving up.
    pub max_retry: Duration,
    /// How long to wait between connection attempts.
    pub retry_wait: Duration,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            queue_size: 200,
            max_retry: Duration::from_secs(1),
            retry_wait: Duration::from_millis(10),
        }
    }
}

impl RequestQueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retry < Duration::from_millis(1) {
            return Err(Error::InvalidArgument(
                "max retry must not be less than 1 ms".to_string(),
            ));
        }
        if self.retry_wait < Duration::from_millis(1) {
            return Err(Error::InvalidArgument(
                "retry wait must not be less than 1 ms".to_string(),
            ));
        }
        if self.queue_size < 1 || self.queue_size > MAX_OUTSTANDING as usize {
            return Err(Error::InvalidArgument(format!(
                "queue size must be between 1 and {MAX_OUTSTANDING}, got {}",
                self.queue_size
            )));
        }
        Ok(())
    }
}
