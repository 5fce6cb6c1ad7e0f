use cachestore_api::{
    CommitRequest, Error, FailureReporter, Result, UpdateQueueServer, UpdateRequest,
};
use cachestore_id::{BindingKey, NodeId, ObjectId};
use cachestore_queue::{
    NodeQueues, QueuedRequest, RequestQueue, RequestQueueClient, RequestQueueConfig,
    RequestQueueListener, RequestQueueServer,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Debug, Default)]
struct Recorder {
    /// Evicted objects, with 0 standing for any binding.
    evicted: Mutex<Vec<u64>>,
    /// How many binding evictions time out before one succeeds.
    timeouts: Mutex<usize>,
}

impl UpdateQueueServer for Recorder {
    fn commit(&self, _node_id: NodeId, _commit: &CommitRequest) -> Result<()> {
        Ok(())
    }

    fn evict_object(&self, _node_id: NodeId, oid: ObjectId) -> Result<()> {
        self.evicted.lock().push(oid.as_u64());
        Ok(())
    }

    fn downgrade_object(&self, _node_id: NodeId, oid: ObjectId) -> Result<()> {
        Err(Error::CacheConsistency(format!("object {oid} is not locked")))
    }

    fn evict_binding(&self, _node_id: NodeId, key: &BindingKey) -> Result<()> {
        let mut timeouts = self.timeouts.lock();
        if *timeouts > 0 {
            *timeouts -= 1;
            return Err(Error::Timeout(format!("lock of binding {key} timed out")));
        }
        self.evicted.lock().push(0);
        Ok(())
    }

    fn downgrade_binding(&self, _node_id: NodeId, _key: &BindingKey) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct OneNode {
    server: Arc<RequestQueueServer>,
}

impl NodeQueues for OneNode {
    fn request_queue_server(&self, node_id: NodeId) -> Result<Arc<RequestQueueServer>> {
        if node_id == self.server.node_id() {
            Ok(Arc::clone(&self.server))
        } else {
            Err(Error::IllegalState(format!("node {node_id} is not registered")))
        }
    }
}

#[derive(Debug, Default)]
struct Failures(Mutex<Vec<Error>>);

impl FailureReporter for Failures {
    fn report_failure(&self, error: &Error) {
        self.0.lock().push(error.clone());
    }
}

fn config() -> RequestQueueConfig {
    RequestQueueConfig {
        queue_size: 10,
        max_retry: Duration::from_secs(5),
        retry_wait: Duration::from_millis(5),
    }
}

fn evict(value: u64, completed: &Arc<AtomicUsize>) -> QueuedRequest {
    let completed = Arc::clone(completed);
    QueuedRequest::with_completion(
        UpdateRequest::EvictObject(ObjectId::new(value).unwrap()),
        Box::new(move || {
            completed.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn requests_arrive_in_order_across_reconnects() {
    let recorder = Arc::new(Recorder::default());
    let node_id = NodeId::new(1);
    let server = Arc::new(RequestQueueServer::new(
        node_id,
        Arc::clone(&recorder) as _,
    ));
    let listener = RequestQueueListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(OneNode {
            server: Arc::clone(&server),
        }),
    )
    .await
    .unwrap();
    let failures = Arc::new(Failures::default());
    let client = Arc::new(
        RequestQueueClient::new(
            node_id,
            listener.local_addr(),
            config(),
            Arc::clone(&failures) as _,
        )
        .unwrap(),
    );

    let completed = Arc::new(AtomicUsize::new(0));
    let sender = Arc::clone(&client);
    let sender_completed = Arc::clone(&completed);
    let server_for_drops = Arc::clone(&server);
    tokio::task::spawn_blocking(move || {
        for i in 0..100 {
            if i % 25 == 10 {
                // Cut the connection; the client reconnects and resends.
                server_for_drops.disconnect();
            }
            sender.add_request(evict(i, &sender_completed)).unwrap();
        }
        sender.shutdown();
    })
    .await
    .unwrap();

    assert_eq!(completed.load(Ordering::SeqCst), 100);
    assert_eq!(*recorder.evicted.lock(), (0..100).collect::<Vec<_>>());
    assert!(failures.0.lock().is_empty());
    listener.shutdown();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn timed_out_requests_are_resent_in_order() {
    let recorder = Arc::new(Recorder::default());
    *recorder.timeouts.lock() = 2;
    let node_id = NodeId::new(1);
    let server = Arc::new(RequestQueueServer::new(
        node_id,
        Arc::clone(&recorder) as _,
    ));
    let listener = RequestQueueListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(OneNode { server }),
    )
    .await
    .unwrap();
    let failures = Arc::new(Failures::default());
    let client = RequestQueueClient::new(
        node_id,
        listener.local_addr(),
        config(),
        Arc::clone(&failures) as _,
    )
    .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let sender_completed = Arc::clone(&completed);
    tokio::task::spawn_blocking(move || {
        client
            .add_request(QueuedRequest::new(UpdateRequest::EvictBinding(
                BindingKey::new("alice"),
            )))
            .unwrap();
        for i in 1..=5 {
            client.add_request(evict(i, &sender_completed)).unwrap();
        }
        client.shutdown();
    })
    .await
    .unwrap();

    assert_eq!(completed.load(Ordering::SeqCst), 5);
    assert_eq!(*recorder.evicted.lock(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(*recorder.timeouts.lock(), 0);
    assert!(failures.0.lock().is_empty());
    listener.shutdown();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn remote_failure_stops_the_queue() {
    let node_id = NodeId::new(1);
    let server = Arc::new(RequestQueueServer::new(
        node_id,
        Arc::new(Recorder::default()) as _,
    ));
    let listener = RequestQueueListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(OneNode { server }),
    )
    .await
    .unwrap();
    let failures = Arc::new(Failures::default());
    let client = RequestQueueClient::new(
        node_id,
        listener.local_addr(),
        config(),
        Arc::clone(&failures) as _,
    )
    .unwrap();

    tokio::task::spawn_blocking(move || {
        client
            .add_request(QueuedRequest::new(UpdateRequest::DowngradeObject(
                ObjectId::MIN,
            )))
            .unwrap();
        client.shutdown();
    })
    .await
    .unwrap();

    let failures = failures.0.lock();
    assert_eq!(failures.len(), 1);
    assert!(
        matches!(failures[0], Error::CacheConsistency(_)),
        "{:?}",
        failures[0]
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn unknown_node_is_refused() {
    let server = Arc::new(RequestQueueServer::new(
        NodeId::new(1),
        Arc::new(Recorder::default()) as _,
    ));
    let listener = RequestQueueListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(OneNode { server }),
    )
    .await
    .unwrap();
    let failures = Arc::new(Failures::default());
    let client = RequestQueueClient::new(
        NodeId::new(2),
        listener.local_addr(),
        config(),
        Arc::clone(&failures) as _,
    )
    .unwrap();

    tokio::task::spawn_blocking(move || client.shutdown())
        .await
        .unwrap();
    let failures = failures.0.lock();
    assert!(matches!(failures[..], [Error::IllegalState(_)]), "{failures:?}");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn gives_up_when_server_is_unreachable() {
    // Bind and drop a listener to find a port nothing listens on.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let failures = Arc::new(Failures::default());
    let client = RequestQueueClient::new(
        NodeId::new(1),
        addr,
        RequestQueueConfig {
            queue_size: 10,
            max_retry: Duration::from_millis(50),
            retry_wait: Duration::from_millis(5),
        },
        Arc::clone(&failures) as _,
    )
    .unwrap();

    tokio::task::spawn_blocking(move || {
        let _ = client.add_request(QueuedRequest::new(UpdateRequest::EvictObject(
            ObjectId::MIN,
        )));
        client.shutdown();
    })
    .await
    .unwrap();
    let failures = failures.0.lock();
    assert!(matches!(failures[..], [Error::Network(_)]), "{failures:?}");
}
