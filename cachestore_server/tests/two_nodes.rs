use bytes::Bytes;
use cachestore_api::{CallbackServer, CommitRequest, DataServer, Error, Result, UpdateRequest};
use cachestore_id::{BindingKey, NodeId, ObjectId};
use cachestore_queue::{Handled, NodeQueues, RequestNumber};
use cachestore_server::{CachingServer, MemoryStorage, ServerConfig};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Records callbacks, releasing at once or leaving the release for later.
#[derive(Debug)]
struct FakeNode {
    release: bool,
    requests: Mutex<Vec<String>>,
}

impl FakeNode {
    fn new(release: bool) -> Arc<Self> {
        Arc::new(Self {
            release,
            requests: Mutex::new(vec![]),
        })
    }

    fn record(&self, request: String) -> Result<bool> {
        self.requests.lock().push(request);
        Ok(self.release)
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl CallbackServer for FakeNode {
    fn request_downgrade_object(&self, oid: ObjectId, requester: NodeId) -> Result<bool> {
        self.record(format!("downgrade object {oid} for {requester}"))
    }

    fn request_evict_object(&self, oid: ObjectId, requester: NodeId) -> Result<bool> {
        self.record(format!("evict object {oid} for {requester}"))
    }

    fn request_downgrade_binding(&self, key: &BindingKey, requester: NodeId) -> Result<bool> {
        self.record(format!("downgrade binding {key} for {requester}"))
    }

    fn request_evict_binding(&self, key: &BindingKey, requester: NodeId) -> Result<bool> {
        self.record(format!("evict binding {key} for {requester}"))
    }
}

/// Sends update queue requests for one node, numbering them in order.
struct Updates<'a> {
    server: &'a CachingServer,
    node_id: NodeId,
    next: RequestNumber,
}

impl<'a> Updates<'a> {
    fn new(server: &'a CachingServer, node_id: NodeId) -> Self {
        Self {
            server,
            node_id,
            next: RequestNumber::ZERO,
        }
    }

    fn send(&mut self, request: UpdateRequest) -> Result<()> {
        let queue = self.server.request_queue_server(self.node_id)?;
        let number = self.next;
        self.next = number.next();
        match queue.handle(number, &request).unwrap() {
            Handled::Performed(result) => result,
            Handled::Duplicate => panic!("request {number} was a duplicate"),
        }
    }

    fn commit_objects(
        &mut self,
        new_oids: usize,
        objects: &[(ObjectId, Option<Bytes>)],
    ) -> Result<()> {
        self.send(UpdateRequest::Commit(CommitRequest {
            oids: objects.iter().map(|(oid, _)| *oid).collect(),
            oid_values: objects.iter().map(|(_, value)| value.clone()).collect(),
            new_oids,
            ..Default::default()
        }))
    }

    fn commit_names(&mut self, names: &[(&str, Option<ObjectId>)]) -> Result<()> {
        self.send(UpdateRequest::Commit(CommitRequest {
            names: names.iter().map(|(name, _)| name.to_string()).collect(),
            name_values: names.iter().map(|(_, oid)| *oid).collect(),
            ..Default::default()
        }))
    }
}

fn server() -> CachingServer {
    CachingServer::new(
        ServerConfig {
            lock_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        Arc::new(MemoryStorage::new()),
    )
    .unwrap()
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test_log::test]
fn committed_object_is_read_back() {
    let server = server();
    let node = server.register_node(FakeNode::new(true)).unwrap().node_id;
    let first = server.new_object_ids(50).unwrap();
    let oid = first.offset(42).unwrap();

    Updates::new(&server, node)
        .commit_objects(1, &[(oid, Some(Bytes::from_static(&[1, 2, 3])))])
        .unwrap();

    let results = server.get_object(node, oid).unwrap().unwrap();
    assert_eq!(results.data, Bytes::from_static(&[1, 2, 3]));
    assert!(!results.callback_evict);
    assert_eq!(server.get_object(node, first).unwrap(), None);

    let next = server.next_object_id(node, None).unwrap().unwrap();
    assert_eq!(next.oid, oid);
    assert_eq!(server.next_object_id(node, Some(oid)).unwrap(), None);
}

#[test_log::test]
fn second_writer_waits_for_eviction() {
    let server = Arc::new(server());
    let first = FakeNode::new(false);
    let a = server.register_node(Arc::clone(&first) as _).unwrap().node_id;
    let b = server.register_node(FakeNode::new(false)).unwrap().node_id;
    let oid = server.new_object_ids(1).unwrap();
    let mut updates = Updates::new(&server, a);
    updates.commit_objects(1, &[(oid, Some(Bytes::from_static(b"one")))]).unwrap();

    let writer = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.get_object_for_update(b, oid))
    };

    wait_until("evict callback", || !first.requests().is_empty());
    assert_eq!(first.requests(), vec![format!("evict object {oid} for {b}")]);
    assert!(!writer.is_finished());

    // The holder commits its own change before giving the object up
    updates.commit_objects(0, &[(oid, Some(Bytes::from_static(b"two")))]).unwrap();
    updates.send(UpdateRequest::EvictObject(oid)).unwrap();

    let results = writer.join().unwrap().unwrap().unwrap();
    assert_eq!(results.data, Bytes::from_static(b"two"));
    // a no longer holds the object
    let err = updates.send(UpdateRequest::EvictObject(oid)).unwrap_err();
    assert!(matches!(err, Error::CacheConsistency(_)), "{err}");
}

#[test_log::test]
fn reader_downgrades_writer() {
    let server = Arc::new(server());
    let writer = FakeNode::new(true);
    let reader = FakeNode::new(true);
    let a = server.register_node(Arc::clone(&writer) as _).unwrap().node_id;
    let b = server.register_node(Arc::clone(&reader) as _).unwrap().node_id;
    let oid = server.new_object_ids(1).unwrap();
    Updates::new(&server, a)
        .commit_objects(1, &[(oid, Some(Bytes::from_static(b"data")))])
        .unwrap();

    let results = server.get_object(b, oid).unwrap().unwrap();
    assert_eq!(results.data, Bytes::from_static(b"data"));
    assert_eq!(writer.requests(), vec![format!("downgrade object {oid} for {b}")]);

    // a kept a read lock, so it may upgrade, which evicts b
    server.upgrade_object(a, oid).unwrap();
    assert_eq!(reader.requests(), vec![format!("evict object {oid} for {a}")]);
}

#[test_log::test]
fn upgrade_requires_a_read_lock() {
    let server = server();
    let node = server.register_node(FakeNode::new(true)).unwrap().node_id;
    let err = server.upgrade_object(node, ObjectId::MIN).unwrap_err();
    assert!(matches!(err, Error::CacheConsistency(_)), "{err}");
}

#[test_log::test]
fn binding_ranges() {
    let server = server();
    let node = server.register_node(FakeNode::new(true)).unwrap().node_id;
    let oid = server.new_object_ids(1).unwrap();
    let mut updates = Updates::new(&server, node);

    let results = server.get_binding_for_update(node, "bob").unwrap();
    assert!(!results.found);
    assert_eq!(results.next_key, Some(BindingKey::LAST));
    assert_eq!(results.oid, None);
    updates.commit_names(&[("bob", Some(oid))]).unwrap();

    let alice = server.get_binding(node, "alice").unwrap();
    assert!(!alice.found);
    assert_eq!(alice.next_key, Some(BindingKey::new("bob")));
    assert_eq!(alice.oid, Some(oid));

    let bob = server.get_binding(node, "bob").unwrap();
    assert!(bob.found);
    assert_eq!(bob.next_key, None);
    assert_eq!(bob.oid, Some(oid));

    let first = server.next_bound_name(node, None).unwrap();
    assert_eq!(first.next_key, BindingKey::new("bob"));
    let after = server.next_bound_name(node, Some("bob")).unwrap();
    assert_eq!(after.next_key, BindingKey::LAST);
    assert_eq!(after.oid, None);

    let remove = server.get_binding_for_remove(node, "bob").unwrap();
    assert!(remove.found);
    assert_eq!(remove.oid, Some(oid));
    assert_eq!(remove.next_key, BindingKey::LAST);
    assert_eq!(remove.next_oid, None);
    updates.commit_names(&[("bob", None)]).unwrap();

    let after = server.next_bound_name(node, Some("alice")).unwrap();
    assert_eq!(after.next_key, BindingKey::LAST);
    let bob = server.get_binding(node, "bob").unwrap();
    assert!(!bob.found);
}

#[test_log::test]
fn binding_lookup_calls_back_the_next_name_holder() {
    let server = server();
    let holder = FakeNode::new(true);
    let a = server.register_node(Arc::clone(&holder) as _).unwrap().node_id;
    let b = server.register_node(FakeNode::new(true)).unwrap().node_id;

    // a is about to bind a name somewhere before LAST
    server.get_binding_for_update(a, "m").unwrap();
    let results = server.get_binding(b, "z").unwrap();
    assert_eq!(results.next_key, Some(BindingKey::LAST));
    assert_eq!(
        holder.requests(),
        vec![format!("downgrade binding {} for {b}", BindingKey::LAST)]
    );
}

#[test_log::test]
fn unlocked_changes_are_consistency_errors() {
    let server = server();
    let node = server.register_node(FakeNode::new(true)).unwrap().node_id;
    let oid = server.new_object_ids(1).unwrap();
    let mut updates = Updates::new(&server, node);

    let err = updates
        .commit_objects(0, &[(oid, Some(Bytes::from_static(b"sneaky")))])
        .unwrap_err();
    assert!(matches!(err, Error::CacheConsistency(_)), "{err}");
    let err = updates.commit_names(&[("alice", Some(oid))]).unwrap_err();
    assert!(matches!(err, Error::CacheConsistency(_)), "{err}");
    let err = updates
        .send(UpdateRequest::DowngradeBinding(BindingKey::new("alice")))
        .unwrap_err();
    assert!(matches!(err, Error::CacheConsistency(_)), "{err}");

    // Nothing was written
    let other = server.register_node(FakeNode::new(true)).unwrap().node_id;
    assert_eq!(server.get_object(other, oid).unwrap(), None);
    assert!(!server.get_binding(other, "alice").unwrap().found);
}

#[test_log::test]
fn shut_down_node_loses_its_locks() {
    let server = server();
    let holder = FakeNode::new(false);
    let a = server.register_node(Arc::clone(&holder) as _).unwrap().node_id;
    let b = server.register_node(FakeNode::new(true)).unwrap().node_id;
    let oid = server.new_object_ids(1).unwrap();
    Updates::new(&server, a)
        .commit_objects(1, &[(oid, Some(Bytes::from_static(b"held")))])
        .unwrap();

    server.shutdown_node(a);
    server.shutdown_node(a);
    assert_eq!(server.node_count(), 1);

    let results = server.get_object_for_update(b, oid).unwrap().unwrap();
    assert_eq!(results.data, Bytes::from_static(b"held"));
    assert!(holder.requests().is_empty());

    assert!(matches!(
        server.get_object(a, oid),
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(
        server.request_queue_server(a),
        Err(Error::IllegalState(_))
    ));
}

#[test_log::test]
fn class_registry() {
    let server = server();
    let id = server.get_class_id(b"descriptor").unwrap();
    assert_eq!(server.get_class_id(b"descriptor").unwrap(), id);
    assert_eq!(
        server.get_class_info(id).unwrap(),
        Some(Bytes::from_static(b"descriptor"))
    );
}
