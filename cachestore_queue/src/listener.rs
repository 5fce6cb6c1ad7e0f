use crate::{
    codec::{ClientFrame, Response, ServerCodec},
    server::{Handled, RequestQueueServer},
};
use cachestore_api::{Error, Result};
use cachestore_id::NodeId;
use futures::{SinkExt, StreamExt};
use std::{fmt::Debug, net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, error, info, warn};

/// Finds the queue server for a connecting node.
pub trait NodeQueues: Debug + Send + Sync + 'static {
    fn request_queue_server(&self, node_id: NodeId) -> Result<Arc<RequestQueueServer>>;
}

/// Accepts update queue connections from nodes and feeds their requests to the node's
/// [`RequestQueueServer`].
#[derive(Debug)]
pub struct RequestQueueListener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl RequestQueueListener {
    /// Binds `addr` and starts accepting connections on the current runtime.
    pub async fn bind(addr: SocketAddr, nodes: Arc<dyn NodeQueues>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("cannot bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?;
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(listener, nodes, shutdown.clone()));
        info!(%local_addr, "update queue listener started");
        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and closes the open ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RequestQueueListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    nodes: Arc<dyn NodeQueues>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "update queue connection accepted");
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    Arc::clone(&nodes),
                    shutdown.child_token(),
                ));
            }
            Err(e) => warn!(%e, "error accepting update queue connection"),
        }
    }
    info!("update queue listener stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    nodes: Arc<dyn NodeQueues>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%e, "cannot disable Nagle's algorithm");
    }
    let mut framed = Framed::new(stream, ServerCodec::default());

    let node_id = match framed.next().await {
        Some(Ok(ClientFrame::Hello(node_id))) => node_id,
        Some(Ok(frame)) => {
            warn!(%peer, ?frame, "update queue connection did not start with a node id");
            return;
        }
        Some(Err(e)) => {
            warn!(%peer, %e, "malformed update queue handshake");
            return;
        }
        None => return,
    };
    let server = match nodes.request_queue_server(node_id) {
        Ok(server) => server,
        Err(e) => {
            warn!(%peer, %node_id, %e, "refusing update queue connection");
            let _ = framed.send(Response::from_result(&Err(e))).await;
            return;
        }
    };
    let connection = server.connect();
    if let Err(e) = framed.send(Response::Ok).await {
        debug!(%peer, %node_id, %e, "update queue handshake failed");
        return;
    }
    info!(%peer, %node_id, "update queue connected");

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = connection.cancelled() => break,
            frame = framed.next() => frame,
        };
        let (number, request) = match frame {
            Some(Ok(ClientFrame::Request { number, request })) => (number, request),
            Some(Ok(ClientFrame::Hello(_))) => {
                warn!(%peer, %node_id, "unexpected node id on update queue connection");
                break;
            }
            Some(Err(e)) => {
                warn!(%peer, %node_id, %e, "malformed update queue request");
                break;
            }
            None => break,
        };

        let handler = Arc::clone(&server);
        let handled = tokio::task::spawn_blocking(move || handler.handle(number, &request)).await;
        let mut failed = false;
        let response = match handled {
            Ok(Ok(Handled::Performed(result))) => {
                failed = result.is_err();
                Response::from_result(&result)
            }
            Ok(Ok(Handled::Duplicate)) => Response::Ok,
            Ok(Err(e)) => {
                warn!(%peer, %node_id, %e, "dropping update queue connection");
                break;
            }
            Err(e) => {
                error!(%peer, %node_id, %e, "update queue request panicked");
                break;
            }
        };
        if let Err(e) = framed.send(response).await {
            debug!(%peer, %node_id, %e, "cannot send update queue response");
            break;
        }
        // Requests sent after a failed one must not be performed ahead of its resend
        if failed {
            break;
        }
    }
    info!(%peer, %node_id, "update queue disconnected");
}
