use crate::{
    OnFailure, QueuedRequest, RequestQueue, RequestQueueConfig,
    codec::{ClientCodec, ClientFrame},
    sequence::RequestNumber,
};
use cachestore_api::{Error, FailureReporter, Result};
use cachestore_id::NodeId;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    thread::JoinHandle,
    time::Instant,
};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, error, info, warn};

/// The client end of an update queue connected to the server over TCP.
///
/// The connection is driven by a dedicated thread. Requests stay queued until the
/// server acknowledges them and are resent after a reconnect. Network failures are
/// retried for up to [`RequestQueueConfig::max_retry`]. A request the server could not
/// perform yet, because a lock timed out or deadlocked, is resent on a new connection.
/// After any other failure the queue shuts down, reporting the failure unless the
/// server is shutting down.
#[derive(Debug)]
pub struct RequestQueueClient {
    sender: Mutex<Option<mpsc::Sender<QueuedRequest>>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestQueueClient {
    pub fn new(
        node_id: NodeId,
        addr: SocketAddr,
        config: RequestQueueConfig,
        reporter: Arc<dyn FailureReporter>,
    ) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(config.queue_size);
        let shutdown = CancellationToken::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::IllegalState(format!("cannot start update queue runtime: {e}")))?;
        let connection = Connection {
            node_id,
            addr,
            config,
            reporter,
            receiver,
            input_closed: false,
            sent: VecDeque::new(),
            next_number: RequestNumber::ZERO,
            failure_started: None,
            resend_started: None,
            shutdown: shutdown.clone(),
        };
        let worker = std::thread::Builder::new()
            .name(format!("update-queue-{node_id}"))
            .spawn(move || runtime.block_on(connection.run()))
            .map_err(|e| Error::IllegalState(format!("cannot start update queue thread: {e}")))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl RequestQueue for RequestQueueClient {
    fn add_request(&self, request: QueuedRequest) -> Result<()> {
        let sender = self.sender.lock().clone().ok_or(Error::ShuttingDown)?;
        sender.blocking_send(request).map_err(|_| Error::ShuttingDown)
    }

    fn shutdown(&self) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != std::thread::current().id() && worker.join().is_err() {
                error!("update queue thread panicked");
            }
        }
    }
}

impl Drop for RequestQueueClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Sent {
    number: RequestNumber,
    queued: QueuedRequest,
}

struct Connection {
    node_id: NodeId,
    addr: SocketAddr,
    config: RequestQueueConfig,
    reporter: Arc<dyn FailureReporter>,
    receiver: mpsc::Receiver<QueuedRequest>,
    input_closed: bool,
    /// Sent but not yet acknowledged, oldest first.
    sent: VecDeque<Sent>,
    next_number: RequestNumber,
    failure_started: Option<Instant>,
    /// When the server first failed the oldest outstanding request.
    resend_started: Option<Instant>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(mut self) {
        loop {
            let error = match self.connect_and_serve().await {
                Ok(()) => {
                    debug!(node_id = %self.node_id, "update queue finished");
                    return;
                }
                Err(e) => e,
            };
            if !self.note_connection_error(error) {
                self.receiver.close();
                return;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_wait) => {}
            }
        }
    }

    /// Returns whether to try connecting again.
    fn note_connection_error(&mut self, error: Error) -> bool {
        if error.is_network() {
            let now = Instant::now();
            let started = *self.failure_started.get_or_insert(now);
            if now.duration_since(started) < self.config.max_retry {
                debug!(node_id = %self.node_id, %error, "update queue connection failed, retrying");
                return true;
            }
            error!(
                node_id = %self.node_id,
                %error,
                retry = ?self.config.max_retry,
                "update queue giving up after network failures"
            );
            self.reporter.report_failure(&error);
            return false;
        }
        match OnFailure::for_error(&error) {
            OnFailure::Resend => {
                let started = *self.resend_started.get_or_insert_with(Instant::now);
                // Once no more requests are coming, give up like for network failures
                if self.input_closed && started.elapsed() >= self.config.max_retry {
                    warn!(node_id = %self.node_id, %error, "update queue stopped with requests unperformed");
                    return false;
                }
                debug!(node_id = %self.node_id, %error, "resending update requests");
                true
            }
            OnFailure::Stop => {
                info!(node_id = %self.node_id, %error, "update queue stopped");
                false
            }
            OnFailure::Report => {
                error!(node_id = %self.node_id, %error, "update queue failed");
                self.reporter.report_failure(&error);
                false
            }
        }
    }

    async fn connect_and_serve(&mut self) -> Result<()> {
        let stream = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            stream = TcpStream::connect(self.addr) => {
                stream.map_err(|e| Error::Network(format!("connect to {}: {e}", self.addr)))?
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%e, "cannot disable Nagle's algorithm");
        }
        let mut framed = Framed::new(stream, ClientCodec);

        framed.send(ClientFrame::Hello(self.node_id)).await?;
        match framed.next().await {
            Some(response) => response?.into_result()?,
            None => {
                return Err(Error::Network(
                    "connection closed during handshake".to_string(),
                ));
            }
        }
        self.failure_started = None;
        info!(
            node_id = %self.node_id,
            addr = %self.addr,
            resending = self.sent.len(),
            "update queue connected"
        );

        let resend: Vec<_> = self
            .sent
            .iter()
            .map(|sent| ClientFrame::Request {
                number: sent.number,
                request: sent.queued.request.clone(),
            })
            .collect();
        for frame in resend {
            framed.feed(frame).await?;
        }
        framed.flush().await?;

        loop {
            if self.input_closed && self.sent.is_empty() {
                return Ok(());
            }
            let can_send = !self.input_closed && self.sent.len() < self.config.queue_size;
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                response = framed.next() => {
                    let Some(response) = response else {
                        return Err(Error::Network("connection closed by server".to_string()));
                    };
                    response?.into_result()?;
                    let Some(done) = self.sent.pop_front() else {
                        return Err(Error::IllegalState(
                            "response received with no request outstanding".to_string(),
                        ));
                    };
                    self.failure_started = None;
                    self.resend_started = None;
                    done.queued.complete();
                }
                queued = self.receiver.recv(), if can_send => match queued {
                    None => self.input_closed = true,
                    Some(queued) => {
                        let number = self.next_number;
                        self.next_number = number.next();
                        let request = queued.request.clone();
                        self.sent.push_back(Sent { number, queued });
                        framed.send(ClientFrame::Request { number, request }).await?;
                    }
                },
            }
        }
    }
}
