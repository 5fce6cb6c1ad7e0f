//! Cache entries and the states they move through.
//!
//! ```text
//!  |>---------------FetchingWrite------------->|
//!  |                                            |
//!  |>---FetchingRead--->|>--FetchingUpgrade-->|
//!  |                    |                     |
//! Decached          CachedRead            CachedWrite<->CachedDirty
//!  |                    |                     |
//!  |<---EvictingRead---<|<-EvictingDowngrade-<|
//!  |                                            |
//!  |<---------------EvictingWrite-------------<|
//! ```

use bytes::Bytes;
use cachestore_api::{Error, Result};
use cachestore_id::{BindingKey, ContextId, ObjectId};
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Being fetched for read.
    FetchingRead,
    CachedRead,
    /// Readable, and being upgraded to write.
    FetchingUpgrade,
    /// Being fetched for read and write.
    FetchingWrite,
    CachedWrite,
    /// Writable and modified by a running transaction.
    CachedDirty,
    /// Readable, and giving up write access.
    EvictingDowngrade,
    EvictingRead,
    EvictingWrite,
    /// Gone from the cache.
    Decached,
}

impl State {
    pub(crate) fn reading(self) -> bool {
        matches!(self, Self::FetchingRead | Self::FetchingWrite)
    }

    pub(crate) fn readable(self) -> bool {
        matches!(
            self,
            Self::CachedRead
                | Self::FetchingUpgrade
                | Self::CachedWrite
                | Self::CachedDirty
                | Self::EvictingDowngrade
        )
    }

    pub(crate) fn upgrading(self) -> bool {
        matches!(self, Self::FetchingUpgrade | Self::FetchingWrite)
    }

    pub(crate) fn writable(self) -> bool {
        matches!(self, Self::CachedWrite | Self::CachedDirty)
    }

    pub(crate) fn modified(self) -> bool {
        self == Self::CachedDirty
    }

    pub(crate) fn downgrading(self) -> bool {
        matches!(self, Self::EvictingDowngrade | Self::EvictingWrite)
    }

    pub(crate) fn decaching(self) -> bool {
        matches!(self, Self::EvictingRead | Self::EvictingWrite)
    }

    pub(crate) fn decached(self) -> bool {
        self == Self::Decached
    }
}

/// The value of a cached object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ObjectValue {
    /// Created by a running transaction and not yet given data.
    New,
    /// Not present on the server, or removed.
    Removed,
    Data(Bytes),
}

impl ObjectValue {
    pub(crate) fn from_server(data: Option<Bytes>) -> Self {
        match data {
            Some(data) => Self::Data(data),
            None => Self::Removed,
        }
    }

    /// The data sent to the server on commit, `None` removing the object.
    pub(crate) fn to_commit(&self) -> Option<Bytes> {
        match self {
            Self::Data(data) => Some(data.clone()),
            Self::New | Self::Removed => None,
        }
    }

    pub(crate) fn exists(&self) -> bool {
        !matches!(self, Self::Removed)
    }
}

/// What a binding entry knows about the names before its key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BindingData {
    /// The bound object, `None` for LAST.
    pub(crate) oid: Option<ObjectId>,
    /// Every name strictly between this key and the entry's key is known to be unbound.
    previous_key: Option<BindingKey>,
    /// Whether the previous key itself is also known to be unbound.
    previous_key_unbound: bool,
    /// An operation is using this entry to answer a question about an earlier name.
    pending_previous: bool,
}

/// What is known about a name reported as the previous key of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindingState {
    Bound,
    Unbound,
    Unknown,
}

impl BindingData {
    pub(crate) fn new(oid: Option<ObjectId>) -> Self {
        Self {
            oid,
            ..Default::default()
        }
    }

    pub(crate) fn with_previous_key(
        oid: Option<ObjectId>,
        previous_key: Option<BindingKey>,
        previous_key_unbound: bool,
    ) -> Self {
        Self {
            oid,
            previous_key,
            previous_key_unbound,
            pending_previous: false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Entry<V> {
    /// Tells apart successive entries for the same key.
    serial: u64,
    state: State,
    context_id: ContextId,
    pub(crate) value: V,
}

impl<V> Entry<V> {
    pub(crate) fn new(serial: u64, state: State, context_id: ContextId, value: V) -> Self {
        Self {
            serial,
            state,
            context_id,
            value,
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    /// The most recent transaction to use the entry.
    pub(crate) fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub(crate) fn note_access(&mut self, context_id: ContextId) {
        self.context_id = self.context_id.max(context_id);
    }

    fn transition(&mut self, allowed: &[State], to: State, what: &str) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(Error::IllegalState(format!(
                "cannot {what} an entry in state {:?}",
                self.state
            )));
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn set_cached_read(&mut self) -> Result<()> {
        self.transition(&[State::FetchingRead], State::CachedRead, "finish reading")
    }

    pub(crate) fn set_cached_write(&mut self) -> Result<()> {
        self.transition(&[State::FetchingWrite], State::CachedWrite, "finish fetching for write")
    }

    pub(crate) fn set_fetching_upgrade(&mut self) -> Result<()> {
        self.transition(&[State::CachedRead], State::FetchingUpgrade, "start upgrading")
    }

    pub(crate) fn set_upgraded(&mut self) -> Result<()> {
        self.transition(&[State::FetchingUpgrade], State::CachedWrite, "finish upgrading")
    }

    /// Upgrades an entry whose write access was granted by another request.
    pub(crate) fn set_upgraded_immediate(&mut self) -> Result<()> {
        self.transition(&[State::CachedRead], State::CachedWrite, "upgrade")
    }

    /// Gives up an upgrade that failed.
    pub(crate) fn abandon_upgrade(&mut self) -> Result<()> {
        self.transition(&[State::FetchingUpgrade], State::CachedRead, "abandon upgrading")
    }

    pub(crate) fn set_cached_dirty(&mut self) -> Result<()> {
        self.transition(&[State::CachedWrite], State::CachedDirty, "modify")
    }

    pub(crate) fn set_not_modified(&mut self) -> Result<()> {
        self.transition(&[State::CachedDirty], State::CachedWrite, "unmodify")
    }

    pub(crate) fn set_evicting_downgrade(&mut self) -> Result<()> {
        self.transition(&[State::CachedWrite], State::EvictingDowngrade, "start downgrading")
    }

    pub(crate) fn set_evicted_downgrade(&mut self) -> Result<()> {
        self.transition(&[State::EvictingDowngrade], State::CachedRead, "finish downgrading")
    }

    pub(crate) fn set_evicted_downgrade_immediate(&mut self) -> Result<()> {
        self.transition(&[State::CachedWrite], State::CachedRead, "downgrade")
    }

    pub(crate) fn set_evicting(&mut self) -> Result<()> {
        match self.state {
            State::CachedRead => self.state = State::EvictingRead,
            State::CachedWrite => self.state = State::EvictingWrite,
            state => {
                return Err(Error::IllegalState(format!(
                    "cannot start evicting an entry in state {state:?}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn set_evicted(&mut self) -> Result<()> {
        self.transition(
            &[State::EvictingRead, State::EvictingWrite],
            State::Decached,
            "finish evicting",
        )
    }

    pub(crate) fn set_evicted_immediate(&mut self) -> Result<()> {
        self.transition(&[State::CachedRead, State::CachedWrite], State::Decached, "evict")
    }

    /// Drops an entry whose fetch obtained nothing.
    pub(crate) fn set_evicted_abandon_fetching(&mut self) -> Result<()> {
        self.transition(
            &[State::FetchingRead, State::FetchingWrite],
            State::Decached,
            "abandon fetching",
        )
    }

    pub(crate) fn step(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Evicting => self.set_evicting(),
            Step::Evicted => self.set_evicted(),
            Step::EvictedImmediate => self.set_evicted_immediate(),
            Step::EvictingDowngrade => self.set_evicting_downgrade(),
            Step::EvictedDowngrade => self.set_evicted_downgrade(),
            Step::EvictedDowngradeImmediate => self.set_evicted_downgrade_immediate(),
        }
    }
}

/// The transitions that give up access, which apply alike to objects and bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Evicting,
    Evicted,
    EvictedImmediate,
    EvictingDowngrade,
    EvictedDowngrade,
    EvictedDowngradeImmediate,
}

impl Entry<BindingData> {
    pub(crate) fn previous_key(&self) -> Option<&BindingKey> {
        self.value.previous_key.as_ref()
    }

    pub(crate) fn previous_key_unbound(&self) -> bool {
        self.value.previous_key_unbound
    }

    pub(crate) fn pending_previous(&self) -> bool {
        self.value.pending_previous
    }

    pub(crate) fn set_previous_key(&mut self, previous_key: Option<BindingKey>, unbound: bool) {
        self.value.previous_key = previous_key;
        self.value.previous_key_unbound = unbound;
    }

    /// Merges in the fact that the names between `previous_key` and this entry's key are
    /// unbound, with `state` telling what is known about `previous_key` itself. Returns
    /// whether anything changed.
    pub(crate) fn update_previous_key(
        &mut self,
        key: &BindingKey,
        previous_key: &BindingKey,
        state: BindingState,
    ) -> bool {
        let new_unbound = state == BindingState::Unbound;
        let data = &mut self.value;
        match &data.previous_key {
            None if previous_key < key => {
                data.previous_key = Some(previous_key.clone());
                data.previous_key_unbound = new_unbound;
                true
            }
            None => false,
            Some(current) if previous_key < current => {
                data.previous_key = Some(previous_key.clone());
                data.previous_key_unbound = new_unbound;
                true
            }
            Some(current) if previous_key == current && !data.previous_key_unbound && new_unbound => {
                data.previous_key_unbound = true;
                true
            }
            Some(_) if state == BindingState::Bound => {
                data.previous_key = Some(previous_key.clone());
                data.previous_key_unbound = false;
                true
            }
            Some(_) => false,
        }
    }

    /// Whether this entry, keyed by `key`, knows that `name` is unbound.
    pub(crate) fn known_unbound(&self, key: &BindingKey, name: &BindingKey) -> bool {
        let Some(previous_key) = &self.value.previous_key else {
            return false;
        };
        if key <= name {
            return false;
        }
        previous_key < name || (previous_key == name && self.value.previous_key_unbound)
    }

    /// Whether this entry, keyed by `key`, is known to hold the first bound name after
    /// `name`.
    pub(crate) fn is_next_entry(&self, key: &BindingKey, name: &BindingKey) -> bool {
        name < key
            && self
                .value
                .previous_key
                .as_ref()
                .is_some_and(|previous_key| previous_key <= name)
    }

    pub(crate) fn set_pending_previous(&mut self) -> Result<()> {
        if self.value.pending_previous {
            return Err(Error::IllegalState("already pending previous".to_string()));
        }
        if self.state.upgrading() || self.state.downgrading() || self.state.decaching() {
            return Err(Error::IllegalState(format!(
                "cannot set pending previous on an entry in state {:?}",
                self.state
            )));
        }
        self.value.pending_previous = true;
        Ok(())
    }

    pub(crate) fn set_not_pending_previous(&mut self) -> Result<()> {
        if !self.value.pending_previous {
            return Err(Error::IllegalState("not pending previous".to_string()));
        }
        self.value.pending_previous = false;
        Ok(())
    }
}

/// Describes a binding entry for logs and consistency warnings.
pub(crate) struct DisplayBinding<'a>(pub(crate) &'a BindingKey, pub(crate) &'a Entry<BindingData>);

impl Display for DisplayBinding<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self(key, entry) = self;
        write!(f, "binding {key} ({:?}", entry.state)?;
        if let Some(oid) = entry.value.oid {
            write!(f, ", oid {oid}")?;
        }
        if let Some(previous_key) = entry.previous_key() {
            write!(
                f,
                ", previous {previous_key}{}",
                if entry.previous_key_unbound() { " unbound" } else { "" }
            )?;
        }
        if entry.pending_previous() {
            f.write_str(", pending")?;
        }
        f.write_str(")")
    }
}
