//! Identifier types shared by cache nodes and the caching server.

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

mod binding_key;
pub use binding_key::BindingKey;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("object id {0} is out of range (expected <= {})", i64::MAX)]
    ObjectIdOutOfRange(u64),
}

/// Identifies a node registered with the caching server.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a stored object. Object ids are non-negative 63-bit values.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
#[serde(try_from = "u64", into = "u64")]
pub struct ObjectId(u64);

impl ObjectId {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(i64::MAX as u64);

    pub fn new(value: u64) -> Result<Self, Error> {
        if value > Self::MAX.0 {
            Err(Error::ObjectIdOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The id that follows this one, if any.
    pub fn next(&self) -> Option<Self> {
        if *self == Self::MAX {
            None
        } else {
            Some(Self(self.0 + 1))
        }
    }

    /// Returns the id `count` places after this one, if it is still in range.
    pub fn offset(&self, count: u64) -> Option<Self> {
        self.0
            .checked_add(count)
            .and_then(|value| Self::new(value).ok())
    }
}

impl TryFrom<u64> for ObjectId {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ObjectId> for u64 {
    fn from(value: ObjectId) -> Self {
        value.0
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Orders transactions on a node. Assigned in strictly increasing order when a
/// transaction starts, and used both to order commits and to judge how recently
/// a cache entry was used.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Lower than the id of any transaction.
    pub const NONE: Self = Self(0);

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ContextId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a registered class descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct ClassId(u32);

impl ClassId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for ClassId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
