use crate::sequence::{OutOfWindow, RequestNumber, earlier_request};
use cachestore_api::{Result, UpdateQueueServer, UpdateRequest};
use cachestore_id::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What became of a numbered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// The request was performed, with this result.
    Performed(Result<()>),
    /// The request had already been performed and was skipped.
    Duplicate,
}

/// The server end of one node's update queue.
///
/// Requests are performed in the order they arrive. A request whose number is not newer
/// than the last one performed is a resend of a request the client never saw
/// acknowledged, and is acknowledged again without being performed.
#[derive(Debug)]
pub struct RequestQueueServer {
    node_id: NodeId,
    handler: Arc<dyn UpdateQueueServer>,
    last_performed: Mutex<RequestNumber>,
    connection: Mutex<Option<CancellationToken>>,
}

impl RequestQueueServer {
    pub fn new(node_id: NodeId, handler: Arc<dyn UpdateQueueServer>) -> Self {
        Self {
            node_id,
            handler,
            last_performed: Mutex::new(RequestNumber::BEFORE_FIRST),
            connection: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Performs the request unless it is a duplicate. Fails if the number is too far
    /// from the last one performed to tell, after which the connection must be dropped.
    pub fn handle(
        &self,
        number: RequestNumber,
        request: &UpdateRequest,
    ) -> Result<Handled, OutOfWindow> {
        let mut last = self.last_performed.lock();
        if number == *last || earlier_request(number, *last)? {
            debug!(node_id = %self.node_id, %number, %request, "skipping duplicate request");
            return Ok(Handled::Duplicate);
        }
        if number != last.next() {
            warn!(
                node_id = %self.node_id,
                %number,
                last = %*last,
                "request numbers skipped"
            );
        }
        let result = request.perform(self.handler.as_ref(), self.node_id);
        match &result {
            // Not recorded as performed, so the resend is not taken for a duplicate
            Err(e) if e.should_retry() => {
                debug!(node_id = %self.node_id, %number, %request, %e, "update request will be resent");
            }
            Err(e) => {
                warn!(node_id = %self.node_id, %number, %request, %e, "update request failed");
                *last = number;
            }
            Ok(()) => *last = number,
        }
        Ok(Handled::Performed(result))
    }

    /// Starts a new connection, ending the previous one. The returned token is cancelled
    /// when the connection should close.
    pub fn connect(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.connection.lock().replace(token.clone()) {
            info!(node_id = %self.node_id, "replacing update queue connection");
            previous.cancel();
        }
        token
    }

    /// Ends the current connection, if any.
    pub fn disconnect(&self) {
        if let Some(token) = self.connection.lock().take() {
            token.cancel();
        }
    }
}
