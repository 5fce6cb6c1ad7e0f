use bytes::Bytes;
use cachestore_api::{
    CallbackServer, DataKey, DataServer, Error, ErrorCategory, FailureReporter,
    GetBindingForRemoveResults, GetBindingForUpdateResults, GetBindingResults,
    GetObjectForUpdateResults, GetObjectResults, NextBoundNameResults, NextObjectResults,
    RegisterNodeResult, Result, RetryPolicy, UpgradeObjectResults,
};
use cachestore_id::{ClassId, NodeId, ObjectId};
use cachestore_node::{
    BindingValue, CachingStore, CheckBindings, DataConflict, DataConflictListener, NodeConfig,
};
use cachestore_queue::NodeQueues;
use cachestore_server::{CachingServer, MemoryStorage, ServerConfig};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{sync::Arc, thread, time::Duration};

fn server() -> Arc<CachingServer> {
    let config = ServerConfig {
        lock_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    Arc::new(CachingServer::new(config, Arc::new(MemoryStorage::new())).unwrap())
}

fn node_config() -> NodeConfig {
    NodeConfig {
        txn_timeout: Duration::from_secs(5),
        lock_timeout: Duration::from_secs(1),
        check_bindings: CheckBindings::Operation,
        ..Default::default()
    }
}

fn node(server: &Arc<CachingServer>, config: NodeConfig) -> CachingStore {
    let store = CachingStore::new(
        config,
        Arc::clone(server) as Arc<dyn DataServer>,
        Some(Arc::clone(server) as Arc<dyn NodeQueues>),
    )
    .unwrap();
    store.ready().unwrap();
    store
}

fn data(s: &'static str) -> Bytes {
    Bytes::from_static(s.as_bytes())
}

fn create(store: &CachingStore, value: &'static str) -> ObjectId {
    let mut txn = store.begin().unwrap();
    let oid = txn.create_object().unwrap();
    txn.set_object(oid, data(value)).unwrap();
    txn.prepare_and_commit().unwrap();
    oid
}

/// Waits for the server to apply the node's commits, which are sent asynchronously.
fn await_commits(store: &CachingStore) {
    assert!(store.await_commits(Duration::from_secs(5)));
}

#[test_log::test]
fn objects_survive_commit() {
    let server = server();
    let store = node(&server, node_config());

    let mut txn = store.begin().unwrap();
    let oid = txn.create_object().unwrap();
    assert!(matches!(txn.get_object(oid), Err(Error::ObjectNotFound(_))));
    txn.set_object(oid, data("one")).unwrap();
    assert_eq!(txn.get_object(oid).unwrap(), data("one"));
    txn.prepare_and_commit().unwrap();
    await_commits(&store);

    let mut txn = store.begin().unwrap();
    assert_eq!(txn.get_object_for_update(oid).unwrap(), data("one"));
    txn.set_object(oid, data("two")).unwrap();
    txn.abort().unwrap();

    let mut txn = store.begin().unwrap();
    assert_eq!(txn.get_object(oid).unwrap(), data("one"));
    assert_eq!(txn.next_object_id(None).unwrap(), Some(oid));
    assert_eq!(txn.next_object_id(Some(oid)).unwrap(), None);
    txn.remove_object(oid).unwrap();
    assert!(matches!(txn.get_object(oid), Err(Error::ObjectNotFound(_))));
    txn.prepare_and_commit().unwrap();
    await_commits(&store);

    let mut txn = store.begin().unwrap();
    assert!(matches!(txn.get_object(oid), Err(Error::ObjectNotFound(_))));
    assert_eq!(txn.next_object_id(None).unwrap(), None);
    drop(txn);
}

#[test_log::test]
fn bindings_use_next_keys() {
    let server = server();
    let store = node(&server, node_config());
    let alice = create(&store, "alice");
    let bob = create(&store, "bob");

    let mut txn = store.begin().unwrap();
    assert_eq!(
        txn.get_binding("alice").unwrap(),
        BindingValue {
            found: false,
            oid: None,
            next_name: None,
        }
    );
    assert!(!txn.set_binding("bob", bob).unwrap().found);
    assert_eq!(
        txn.get_binding("alice").unwrap(),
        BindingValue {
            found: false,
            oid: None,
            next_name: Some("bob".to_string()),
        }
    );
    let value = txn.set_binding("alice", alice).unwrap();
    assert!(!value.found);
    assert_eq!(value.next_name.as_deref(), Some("bob"));
    txn.prepare_and_commit().unwrap();

    let mut txn = store.begin().unwrap();
    assert_eq!(txn.get_binding("alice").unwrap().oid, Some(alice));
    assert_eq!(txn.get_binding("bob").unwrap().oid, Some(bob));
    assert_eq!(
        txn.get_binding("aaron").unwrap().next_name.as_deref(),
        Some("alice")
    );
    assert_eq!(txn.next_bound_name(None).unwrap().as_deref(), Some("alice"));
    assert_eq!(txn.next_bound_name(Some("alice")).unwrap().as_deref(), Some("bob"));
    assert_eq!(txn.next_bound_name(Some("bob")).unwrap(), None);

    // Rebinding returns the old object
    let value = txn.set_binding("alice", bob).unwrap();
    assert!(value.found);
    assert_eq!(value.oid, Some(alice));
    txn.abort().unwrap();

    let mut txn = store.begin().unwrap();
    assert_eq!(txn.get_binding("alice").unwrap().oid, Some(alice));
    let removed = txn.remove_binding("alice").unwrap();
    assert_eq!(
        removed,
        BindingValue {
            found: true,
            oid: Some(alice),
            next_name: Some("bob".to_string()),
        }
    );
    assert!(!txn.get_binding("alice").unwrap().found);
    assert_eq!(txn.next_bound_name(None).unwrap().as_deref(), Some("bob"));
    txn.abort().unwrap();

    let mut txn = store.begin().unwrap();
    assert_eq!(txn.get_binding("alice").unwrap().oid, Some(alice));
    assert!(txn.remove_binding("alice").unwrap().found);
    assert!(!txn.remove_binding("alice").unwrap().found);
    txn.prepare_and_commit().unwrap();

    let mut txn = store.begin().unwrap();
    assert_eq!(txn.next_bound_name(None).unwrap().as_deref(), Some("bob"));
    drop(txn);
    assert_eq!(store.check_bindings(), 0);
}

#[test_log::test]
fn nodes_see_each_others_commits() {
    let server = server();
    let one = node(&server, node_config());
    let two = node(&server, node_config());
    let oid = create(&one, "first");

    let mut txn = one.begin().unwrap();
    txn.set_binding("shared", oid).unwrap();
    txn.prepare_and_commit().unwrap();

    let mut txn = two.begin().unwrap();
    assert_eq!(txn.get_object(oid).unwrap(), data("first"));
    assert_eq!(txn.get_binding("shared").unwrap().oid, Some(oid));
    txn.set_object(oid, data("second")).unwrap();
    txn.remove_binding("shared").unwrap();
    txn.prepare_and_commit().unwrap();

    let mut txn = one.begin().unwrap();
    assert_eq!(txn.get_object(oid).unwrap(), data("second"));
    assert!(!txn.get_binding("shared").unwrap().found);
    drop(txn);
    assert_eq!(one.check_bindings(), 0);
    assert_eq!(two.check_bindings(), 0);
}

#[derive(Debug, Default)]
struct Conflicts(Mutex<Vec<DataConflict>>);

impl DataConflictListener for Conflicts {
    fn node_conflict_detected(&self, access_id: &DataKey, node_id: NodeId, for_update: bool) {
        self.0.lock().push(DataConflict {
            access_id: access_id.clone(),
            node_id,
            for_update,
        });
    }
}

#[test_log::test]
fn writers_wait_for_other_nodes() {
    let server = server();
    let one = node(&server, node_config());
    let two = Arc::new(node(&server, node_config()));
    let conflicts = Arc::new(Conflicts::default());
    one.add_data_conflict_listener(Arc::clone(&conflicts) as Arc<dyn DataConflictListener>);
    let oid = create(&one, "before");

    let mut txn = one.begin().unwrap();
    txn.get_object_for_update(oid).unwrap();
    let reader = {
        let two = Arc::clone(&two);
        thread::spawn(move || {
            let mut txn = two.begin().unwrap();
            let value = txn.get_object(oid);
            txn.abort().unwrap();
            value
        })
    };
    thread::sleep(Duration::from_millis(50));
    txn.set_object(oid, data("after")).unwrap();
    txn.prepare_and_commit().unwrap();
    await_commits(&one);

    assert_eq!(reader.join().unwrap().unwrap(), data("after"));
    let expected = DataConflict {
        access_id: DataKey::Object(oid),
        node_id: two.local_node_id(),
        for_update: false,
    };
    for _ in 0..100 {
        if !conflicts.0.lock().is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(conflicts.0.lock().contains(&expected));
}

#[test_log::test]
fn transactions_on_one_node_conflict() {
    let server = server();
    let config = NodeConfig {
        lock_timeout: Duration::from_millis(20),
        ..node_config()
    };
    let store = node(&server, config);
    let oid = create(&store, "value");

    let mut writer = store.begin().unwrap();
    writer.set_object(oid, data("changed")).unwrap();
    let mut reader = store.begin().unwrap();
    let err = reader.get_object(oid).unwrap_err();
    assert!(matches!(err, Error::Timeout(_) | Error::Conflict(_)), "{err}");
    drop(reader);
    writer.prepare_and_commit().unwrap();

    let mut txn = store.begin().unwrap();
    assert_eq!(txn.get_object(oid).unwrap(), data("changed"));
    drop(txn);
}

#[test_log::test]
fn interrupted_transactions_fail() {
    let server = server();
    let store = node(&server, node_config());
    let oid = create(&store, "value");

    let mut txn = store.begin().unwrap();
    txn.interrupter().interrupt();
    assert!(txn.get_object(oid).is_err());
    assert!(txn.prepare_and_commit().is_err());
}

#[test_log::test]
fn cache_evicts_when_full() {
    let server = server();
    let config = NodeConfig {
        cache_size: 1000,
        check_bindings: CheckBindings::None,
        ..node_config()
    };
    let store = node(&server, config);

    let mut oids = vec![];
    for batch in 0..20 {
        let mut txn = store.begin().unwrap();
        for _ in 0..100 {
            let oid = txn.create_object().unwrap();
            txn.set_object(oid, Bytes::from(format!("batch {batch}"))).unwrap();
            oids.push((oid, batch));
        }
        txn.prepare_and_commit().unwrap();
    }
    await_commits(&store);
    let stats = store.cache_stats();
    assert!(stats.objects <= config.cache_size, "{stats:?}");
    assert!(stats.objects < oids.len(), "{stats:?}");

    // Evicted objects come back from the server
    let mut txn = store.begin().unwrap();
    for (oid, batch) in oids.iter().step_by(37) {
        assert_eq!(txn.get_object(*oid).unwrap(), Bytes::from(format!("batch {batch}")));
    }
    txn.prepare_and_commit().unwrap();
    assert!(store.cache_stats().objects <= config.cache_size);
}

#[test_log::test]
fn shutdown_refuses_new_transactions() {
    let server = server();
    let store = node(&server, node_config());
    create(&store, "value");
    store.shutdown();
    assert!(matches!(store.begin(), Err(Error::ShuttingDown)));
}

#[test_log::test]
fn callback_for_removed_name_waits_for_abort() {
    let server = server();
    let one = node(&server, node_config());
    let two = Arc::new(node(&server, node_config()));
    let oid = create(&one, "value");
    let mut txn = one.begin().unwrap();
    txn.set_binding("name", oid).unwrap();
    txn.prepare_and_commit().unwrap();
    await_commits(&one);

    // The removal leaves the name uncached on the first node while it still holds it
    let mut txn = one.begin().unwrap();
    assert!(txn.remove_binding("name").unwrap().found);
    let reader = {
        let two = Arc::clone(&two);
        thread::spawn(move || -> Result<BindingValue> {
            let mut txn = two.begin()?;
            let value = txn.get_binding("name")?;
            txn.abort()?;
            Ok(value)
        })
    };
    thread::sleep(Duration::from_millis(100));
    txn.abort().unwrap();

    let value = reader.join().unwrap().unwrap();
    assert!(value.found);
    assert_eq!(value.oid, Some(oid));
    assert_eq!(one.check_bindings(), 0);
    assert_eq!(two.check_bindings(), 0);
}

#[test_log::test]
fn callback_for_removed_name_waits_for_commit() {
    let server = server();
    let one = node(&server, node_config());
    let two = Arc::new(node(&server, node_config()));
    let oid = create(&one, "value");
    let mut txn = one.begin().unwrap();
    txn.set_binding("name", oid).unwrap();
    txn.prepare_and_commit().unwrap();
    await_commits(&one);

    let mut txn = one.begin().unwrap();
    assert!(txn.remove_binding("name").unwrap().found);
    let reader = {
        let two = Arc::clone(&two);
        thread::spawn(move || -> Result<BindingValue> {
            let mut txn = two.begin()?;
            let value = txn.get_binding("name")?;
            txn.abort()?;
            Ok(value)
        })
    };
    thread::sleep(Duration::from_millis(100));
    txn.prepare_and_commit().unwrap();

    assert!(!reader.join().unwrap().unwrap().found);
    assert_eq!(one.check_bindings(), 0);
    assert_eq!(two.check_bindings(), 0);
}

#[derive(Debug, Default)]
struct Failures(Mutex<Vec<Error>>);

impl FailureReporter for Failures {
    fn report_failure(&self, e: &Error) {
        self.0.lock().push(e.clone());
    }
}

#[test_log::test]
fn nodes_contend_for_bindings() {
    let server = server();
    let failures = Arc::new(Failures::default());
    let nodes: Vec<CachingStore> = (0..2)
        .map(|_| {
            let store = node(&server, node_config());
            store.add_failure_reporter(Arc::clone(&failures) as Arc<dyn FailureReporter>);
            store
        })
        .collect();
    let oid = create(&nodes[0], "target");
    let names = ["a", "b", "c", "d", "e"];

    thread::scope(|scope| {
        for (i, store) in nodes.iter().enumerate() {
            scope.spawn(move || {
                for round in 0..50 {
                    let name = names[(round * 7 + i * 3) % names.len()];
                    let result = (|| -> Result<()> {
                        let mut txn = store.begin()?;
                        if txn.get_binding(name)?.found {
                            txn.remove_binding(name)?;
                        } else {
                            txn.set_binding(name, oid)?;
                        }
                        txn.prepare_and_commit()
                    })();
                    // Losing a race is fine, breaking the cache is not
                    if let Err(e) = result {
                        assert_ne!(e.category(), ErrorCategory::Fatal, "{e}");
                    }
                }
            });
        }
    });

    for store in &nodes {
        await_commits(store);
        assert_eq!(store.check_bindings(), 0);
    }
    assert_eq!(*failures.0.lock(), vec![]);
    let bound = |store: &CachingStore| {
        let mut txn = store.begin().unwrap();
        let bound: Vec<bool> = names
            .iter()
            .map(|name| txn.get_binding(name).unwrap().found)
            .collect();
        txn.abort().unwrap();
        bound
    };
    assert_eq!(bound(&nodes[0]), bound(&nodes[1]));
}

/// Passes calls through to the server, except reads of objects, which cannot reach it.
#[derive(Debug)]
struct Unreachable(Arc<CachingServer>);

impl DataServer for Unreachable {
    fn register_node(&self, callback: Arc<dyn CallbackServer>) -> Result<RegisterNodeResult> {
        self.0.register_node(callback)
    }

    fn new_object_ids(&self, count: u32) -> Result<ObjectId> {
        self.0.new_object_ids(count)
    }

    fn get_object(&self, _node_id: NodeId, _oid: ObjectId) -> Result<Option<GetObjectResults>> {
        Err(Error::Network("server unreachable".to_string()))
    }

    fn get_object_for_update(
        &self,
        node_id: NodeId,
        oid: ObjectId,
    ) -> Result<Option<GetObjectForUpdateResults>> {
        self.0.get_object_for_update(node_id, oid)
    }

    fn upgrade_object(&self, node_id: NodeId, oid: ObjectId) -> Result<UpgradeObjectResults> {
        self.0.upgrade_object(node_id, oid)
    }

    fn next_object_id(
        &self,
        node_id: NodeId,
        oid: Option<ObjectId>,
    ) -> Result<Option<NextObjectResults>> {
        self.0.next_object_id(node_id, oid)
    }

    fn get_binding(&self, node_id: NodeId, name: &str) -> Result<GetBindingResults> {
        self.0.get_binding(node_id, name)
    }

    fn get_binding_for_update(
        &self,
        node_id: NodeId,
        name: &str,
    ) -> Result<GetBindingForUpdateResults> {
        self.0.get_binding_for_update(node_id, name)
    }

    fn get_binding_for_remove(
        &self,
        node_id: NodeId,
        name: &str,
    ) -> Result<GetBindingForRemoveResults> {
        self.0.get_binding_for_remove(node_id, name)
    }

    fn next_bound_name(&self, node_id: NodeId, name: Option<&str>) -> Result<NextBoundNameResults> {
        self.0.next_bound_name(node_id, name)
    }

    fn get_class_id(&self, class_info: &[u8]) -> Result<ClassId> {
        self.0.get_class_id(class_info)
    }

    fn get_class_info(&self, class_id: ClassId) -> Result<Option<Bytes>> {
        self.0.get_class_info(class_id)
    }
}

#[test_log::test]
fn failed_node_refuses_transactions() {
    let server = server();
    let writer = node(&server, node_config());
    let oid = create(&writer, "value");
    await_commits(&writer);
    let config = NodeConfig {
        retry: RetryPolicy {
            max_retry: Duration::from_millis(20),
            retry_wait: Duration::from_millis(5),
        },
        ..node_config()
    };
    let store = CachingStore::new(
        config,
        Arc::new(Unreachable(Arc::clone(&server))),
        Some(Arc::clone(&server) as Arc<dyn NodeQueues>),
    )
    .unwrap();
    store.ready().unwrap();
    let failures = Arc::new(Failures::default());
    store.add_failure_reporter(Arc::clone(&failures) as Arc<dyn FailureReporter>);

    let mut txn = store.begin().unwrap();
    let err = txn.get_object(oid).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Fatal, "{err}");
    drop(txn);
    assert_eq!(failures.0.lock().len(), 1);
    assert!(matches!(store.begin(), Err(Error::NodeFailed(_))));
}
