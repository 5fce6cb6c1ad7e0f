use crate::{Error, Result, server::UpdateQueueServer};
use bytes::Bytes;
use cachestore_id::{BindingKey, NodeId, ObjectId};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The changes made by one transaction.
///
/// `oid_values[i]` is the new value of `oids[i]`, with `None` removing the object. The
/// first `new_oids` objects were created by the transaction. `name_values[i]` binds
/// `names[i]`, with `None` removing the binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub oids: Vec<ObjectId>,
    pub oid_values: Vec<Option<Bytes>>,
    pub new_oids: usize,
    pub names: Vec<String>,
    pub name_values: Vec<Option<ObjectId>>,
}

impl CommitRequest {
    pub fn is_empty(&self) -> bool {
        self.oids.is_empty() && self.names.is_empty()
    }

    /// Checks that values line up with their keys.
    pub fn validate(&self) -> Result<()> {
        if self.oids.len() != self.oid_values.len() {
            return Err(Error::InvalidArgument(format!(
                "{} object ids but {} object values",
                self.oids.len(),
                self.oid_values.len()
            )));
        }
        if self.new_oids > self.oids.len() {
            return Err(Error::InvalidArgument(format!(
                "{} new object ids out of {}",
                self.new_oids,
                self.oids.len()
            )));
        }
        if self.names.len() != self.name_values.len() {
            return Err(Error::InvalidArgument(format!(
                "{} names but {} name values",
                self.names.len(),
                self.name_values.len()
            )));
        }
        Ok(())
    }
}

/// A request sent to the server through a node's update queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRequest {
    Commit(CommitRequest),
    EvictObject(ObjectId),
    DowngradeObject(ObjectId),
    EvictBinding(BindingKey),
    DowngradeBinding(BindingKey),
}

impl UpdateRequest {
    /// Performs the request on behalf of `node_id`.
    pub fn perform(&self, server: &dyn UpdateQueueServer, node_id: NodeId) -> Result<()> {
        match self {
            Self::Commit(commit) => server.commit(node_id, commit),
            Self::EvictObject(oid) => server.evict_object(node_id, *oid),
            Self::DowngradeObject(oid) => server.downgrade_object(node_id, *oid),
            Self::EvictBinding(key) => server.evict_binding(node_id, key),
            Self::DowngradeBinding(key) => server.downgrade_binding(node_id, key),
        }
    }
}

impl Display for UpdateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Commit(commit) => write!(
                f,
                "commit({} objects, {} names)",
                commit.oids.len(),
                commit.names.len()
            ),
            Self::EvictObject(oid) => write!(f, "evict object {oid}"),
            Self::DowngradeObject(oid) => write!(f, "downgrade object {oid}"),
            Self::EvictBinding(key) => write!(f, "evict binding {key}"),
            Self::DowngradeBinding(key) => write!(f, "downgrade binding {key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn oid(value: u64) -> ObjectId {
        ObjectId::new(value).unwrap()
    }

    #[test]
    fn validate_commit() {
        let mut commit = CommitRequest {
            oids: vec![oid(1), oid(2)],
            oid_values: vec![Some(Bytes::from_static(&[1, 2, 3])), None],
            new_oids: 1,
            names: vec!["alice".into()],
            name_values: vec![Some(oid(1))],
        };
        commit.validate().unwrap();

        commit.new_oids = 3;
        assert!(matches!(commit.validate(), Err(Error::InvalidArgument(_))));
        commit.new_oids = 0;
        commit.name_values.push(None);
        assert!(matches!(commit.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn request_serde() {
        let request = UpdateRequest::Commit(CommitRequest {
            oids: vec![oid(42)],
            oid_values: vec![Some(Bytes::from_static(&[1, 2, 3]))],
            new_oids: 1,
            names: vec![],
            name_values: vec![],
        });
        let json = serde_json::to_vec(&request).unwrap();
        let back: UpdateRequest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, request);

        let evict_last = UpdateRequest::EvictBinding(BindingKey::LAST);
        let json = serde_json::to_string(&evict_last).unwrap();
        assert_eq!(json, r#"{"EvictBinding":null}"#);
    }

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl UpdateQueueServer for Recorder {
        fn commit(&self, node_id: NodeId, commit: &CommitRequest) -> Result<()> {
            self.calls
                .lock()
                .push(format!("{node_id}: commit {}", commit.oids.len()));
            Ok(())
        }

        fn evict_object(&self, node_id: NodeId, oid: ObjectId) -> Result<()> {
            self.calls.lock().push(format!("{node_id}: evict {oid}"));
            Ok(())
        }

        fn downgrade_object(&self, node_id: NodeId, oid: ObjectId) -> Result<()> {
            self.calls.lock().push(format!("{node_id}: downgrade {oid}"));
            Ok(())
        }

        fn evict_binding(&self, node_id: NodeId, key: &BindingKey) -> Result<()> {
            self.calls.lock().push(format!("{node_id}: evict {key}"));
            Ok(())
        }

        fn downgrade_binding(&self, _node_id: NodeId, key: &BindingKey) -> Result<()> {
            Err(Error::CacheConsistency(format!("not locked: {key}")))
        }
    }

    #[test]
    fn perform_dispatches() {
        let server = Recorder::default();
        let node = NodeId::new(3);
        UpdateRequest::EvictObject(oid(5))
            .perform(&server, node)
            .unwrap();
        UpdateRequest::EvictBinding(BindingKey::new("bob"))
            .perform(&server, node)
            .unwrap();
        UpdateRequest::Commit(CommitRequest::default())
            .perform(&server, node)
            .unwrap();
        let err = UpdateRequest::DowngradeBinding(BindingKey::LAST)
            .perform(&server, node)
            .unwrap_err();
        assert!(matches!(err, Error::CacheConsistency(_)));
        assert_eq!(
            *server.calls.lock(),
            vec![
                "3: evict 5".to_string(),
                "3: evict \"bob\"".to_string(),
                "3: commit 0".to_string(),
            ]
        );
    }
}
