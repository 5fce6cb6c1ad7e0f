//! Where the server keeps committed objects, bindings and class descriptors.

use bytes::Bytes;
use cachestore_api::{Error, Result};
use cachestore_id::{ClassId, ObjectId};
use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::{collections::BTreeMap, fmt::Debug, ops::Bound};

/// Durable state behind the caching server. Reads see committed data only.
pub trait Storage: Debug + Send + Sync + 'static {
    fn get_object(&self, oid: ObjectId) -> Result<Option<Bytes>>;

    /// The first object after `oid`, or the first object if `oid` is `None`.
    fn next_object(&self, oid: Option<ObjectId>) -> Result<Option<(ObjectId, Bytes)>>;

    /// The first binding whose name is not less than `name`.
    fn ceiling_name(&self, name: &str) -> Result<Option<(String, ObjectId)>>;

    /// The first binding whose name is greater than `name`, or the first binding if
    /// `name` is `None`.
    fn higher_name(&self, name: Option<&str>) -> Result<Option<(String, ObjectId)>>;

    /// Reserves `count` object ids, returning the first.
    fn allocate_object_ids(&self, count: u32) -> Result<ObjectId>;

    /// Reserves `count` node ids, returning the first. Node ids start at 1.
    fn allocate_node_ids(&self, count: u64) -> Result<u64>;

    /// Returns the id of a class descriptor, assigning one if it is new.
    fn class_id(&self, class_info: &[u8]) -> Result<ClassId>;

    fn class_info(&self, class_id: ClassId) -> Result<Option<Bytes>>;

    /// Starts a write. Changes become visible when the write commits and are discarded
    /// if it is dropped first. Reads made through the write see its own changes.
    fn write(&self) -> Result<Box<dyn StorageWrite + '_>>;
}

/// An atomic group of changes.
pub trait StorageWrite {
    fn put_object(&mut self, oid: ObjectId, data: Bytes);

    fn delete_object(&mut self, oid: ObjectId);

    fn ceiling_name(&self, name: &str) -> Option<(String, ObjectId)>;

    fn higher_name(&self, name: &str) -> Option<(String, ObjectId)>;

    fn put_name(&mut self, name: &str, oid: ObjectId);

    fn delete_name(&mut self, name: &str);

    fn commit(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectId, Bytes>,
    names: BTreeMap<String, ObjectId>,
    next_oid: u64,
    next_node_id: u64,
    class_ids: HashMap<Bytes, ClassId>,
    class_infos: Vec<Bytes>,
}

impl State {
    fn ceiling_name(&self, name: &str) -> Option<(String, ObjectId)> {
        self.names
            .range::<str, _>((Bound::Included(name), Bound::Unbounded))
            .next()
            .map(|(name, oid)| (name.clone(), *oid))
    }

    fn higher_name(&self, name: Option<&str>) -> Option<(String, ObjectId)> {
        let lower = match name {
            Some(name) => Bound::Excluded(name),
            None => Bound::Unbounded,
        };
        self.names
            .range::<str, _>((lower, Bound::Unbounded))
            .next()
            .map(|(name, oid)| (name.clone(), *oid))
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_object(&self, oid: ObjectId) -> Result<Option<Bytes>> {
        Ok(self.state.read().objects.get(&oid).cloned())
    }

    fn next_object(&self, oid: Option<ObjectId>) -> Result<Option<(ObjectId, Bytes)>> {
        let lower = match oid {
            Some(oid) => Bound::Excluded(oid),
            None => Bound::Unbounded,
        };
        Ok(self
            .state
            .read()
            .objects
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(oid, data)| (*oid, data.clone())))
    }

    fn ceiling_name(&self, name: &str) -> Result<Option<(String, ObjectId)>> {
        Ok(self.state.read().ceiling_name(name))
    }

    fn higher_name(&self, name: Option<&str>) -> Result<Option<(String, ObjectId)>> {
        Ok(self.state.read().higher_name(name))
    }

    fn allocate_object_ids(&self, count: u32) -> Result<ObjectId> {
        let mut state = self.state.write();
        let first = ObjectId::new(state.next_oid)
            .map_err(|e| Error::ResourceExhausted(e.to_string()))?;
        let next = first
            .offset(u64::from(count))
            .ok_or_else(|| Error::ResourceExhausted("out of object ids".to_string()))?;
        state.next_oid = next.as_u64();
        Ok(first)
    }

    fn allocate_node_ids(&self, count: u64) -> Result<u64> {
        let mut state = self.state.write();
        let first = state.next_node_id.max(1);
        state.next_node_id = first
            .checked_add(count)
            .ok_or_else(|| Error::ResourceExhausted("out of node ids".to_string()))?;
        Ok(first)
    }

    fn class_id(&self, class_info: &[u8]) -> Result<ClassId> {
        let mut state = self.state.write();
        if let Some(id) = state.class_ids.get(class_info) {
            return Ok(*id);
        }
        let info = Bytes::copy_from_slice(class_info);
        state.class_infos.push(info.clone());
        let id = u32::try_from(state.class_infos.len())
            .map(ClassId::new)
            .map_err(|_| Error::ResourceExhausted("out of class ids".to_string()))?;
        state.class_ids.insert(info, id);
        Ok(id)
    }

    fn class_info(&self, class_id: ClassId) -> Result<Option<Bytes>> {
        let index = class_id.as_u32() as usize;
        if index == 0 {
            return Ok(None);
        }
        Ok(self.state.read().class_infos.get(index - 1).cloned())
    }

    fn write(&self) -> Result<Box<dyn StorageWrite + '_>> {
        Ok(Box::new(MemoryWrite {
            state: self.state.write(),
            undo: vec![],
        }))
    }
}

enum Undo {
    Object(ObjectId, Option<Bytes>),
    Name(String, Option<ObjectId>),
}

struct MemoryWrite<'a> {
    state: RwLockWriteGuard<'a, State>,
    undo: Vec<Undo>,
}

impl StorageWrite for MemoryWrite<'_> {
    fn put_object(&mut self, oid: ObjectId, data: Bytes) {
        let previous = self.state.objects.insert(oid, data);
        self.undo.push(Undo::Object(oid, previous));
    }

    fn delete_object(&mut self, oid: ObjectId) {
        let previous = self.state.objects.remove(&oid);
        self.undo.push(Undo::Object(oid, previous));
    }

    fn ceiling_name(&self, name: &str) -> Option<(String, ObjectId)> {
        self.state.ceiling_name(name)
    }

    fn higher_name(&self, name: &str) -> Option<(String, ObjectId)> {
        self.state.higher_name(Some(name))
    }

    fn put_name(&mut self, name: &str, oid: ObjectId) {
        let previous = self.state.names.insert(name.to_string(), oid);
        self.undo.push(Undo::Name(name.to_string(), previous));
    }

    fn delete_name(&mut self, name: &str) {
        let previous = self.state.names.remove(name);
        self.undo.push(Undo::Name(name.to_string(), previous));
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.undo.clear();
        Ok(())
    }
}

impl Drop for MemoryWrite<'_> {
    fn drop(&mut self) {
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Object(oid, Some(data)) => {
                    self.state.objects.insert(oid, data);
                }
                Undo::Object(oid, None) => {
                    self.state.objects.remove(&oid);
                }
                Undo::Name(name, Some(oid)) => {
                    self.state.names.insert(name, oid);
                }
                Undo::Name(name, None) => {
                    self.state.names.remove(&name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn oid(value: u64) -> ObjectId {
        ObjectId::new(value).unwrap()
    }

    #[test]
    fn writes_commit_or_roll_back() {
        let storage = MemoryStorage::new();
        let mut write = storage.write().unwrap();
        write.put_object(oid(1), Bytes::from_static(b"one"));
        write.put_name("alice", oid(1));
        write.commit().unwrap();

        let mut write = storage.write().unwrap();
        write.delete_object(oid(1));
        write.put_name("bob", oid(2));
        write.put_name("alice", oid(3));
        assert_eq!(
            write.ceiling_name("b"),
            Some(("bob".to_string(), oid(2)))
        );
        drop(write);

        assert_eq!(
            storage.get_object(oid(1)).unwrap(),
            Some(Bytes::from_static(b"one"))
        );
        assert_eq!(
            storage.ceiling_name("alice").unwrap(),
            Some(("alice".to_string(), oid(1)))
        );
        assert_eq!(storage.ceiling_name("b").unwrap(), None);
    }

    #[test]
    fn name_navigation() {
        let storage = MemoryStorage::new();
        let mut write = storage.write().unwrap();
        for (i, name) in ["alice", "bob", "carol"].into_iter().enumerate() {
            write.put_name(name, oid(i as u64));
        }
        write.commit().unwrap();

        assert_eq!(
            storage.higher_name(None).unwrap().map(|(n, _)| n),
            Some("alice".to_string())
        );
        assert_eq!(
            storage.higher_name(Some("alice")).unwrap().map(|(n, _)| n),
            Some("bob".to_string())
        );
        assert_eq!(
            storage.ceiling_name("b").unwrap().map(|(n, _)| n),
            Some("bob".to_string())
        );
        assert_eq!(storage.higher_name(Some("carol")).unwrap(), None);
    }

    #[test]
    fn object_ids_and_classes() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.allocate_object_ids(10).unwrap(), oid(0));
        assert_eq!(storage.allocate_object_ids(5).unwrap(), oid(10));
        assert_eq!(storage.allocate_object_ids(1).unwrap(), oid(15));
        assert_eq!(storage.allocate_node_ids(100).unwrap(), 1);
        assert_eq!(storage.allocate_node_ids(100).unwrap(), 101);

        let a = storage.class_id(b"class a").unwrap();
        let b = storage.class_id(b"class b").unwrap();
        assert_ne!(a, b);
        assert_eq!(storage.class_id(b"class a").unwrap(), a);
        assert_eq!(
            storage.class_info(b).unwrap(),
            Some(Bytes::from_static(b"class b"))
        );
        assert_eq!(storage.class_info(ClassId::new(99)).unwrap(), None);
        assert_eq!(storage.class_info(ClassId::new(0)).unwrap(), None);
    }
}
