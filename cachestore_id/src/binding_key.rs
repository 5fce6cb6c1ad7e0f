//! Totally ordered binding names with "before everything" and "after everything"
//! sentinels.

use serde::{Deserialize, Deserializer, Serialize, Serializer, ser::Error as _};
use std::{fmt::Display, sync::Arc};

/// The key of a name binding.
///
/// Real keys are ordered by the UTF-8 bytes of their names. [`BindingKey::FIRST`] sorts
/// before every name and [`BindingKey::LAST`] after every name. `FIRST` only ever appears
/// as a "previous key" bound and never keys a cache entry.
///
/// Keys are cheap to clone: the name is shared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingKey(Repr);

// Variant order is the key order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Repr {
    First,
    Name(Arc<str>),
    Last,
}

impl BindingKey {
    pub const FIRST: Self = Self(Repr::First);
    pub const LAST: Self = Self(Repr::Last);

    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(Repr::Name(name.into()))
    }

    /// Maps an optional name to a key, with `None` standing for [`BindingKey::LAST`].
    pub fn from_name_or_last(name: Option<&str>) -> Self {
        match name {
            Some(name) => Self::new(name),
            None => Self::LAST,
        }
    }

    /// The name, or `None` for either sentinel.
    pub fn name(&self) -> Option<&str> {
        match &self.0 {
            Repr::Name(name) => Some(name),
            Repr::First | Repr::Last => None,
        }
    }

    pub fn is_first(&self) -> bool {
        matches!(self.0, Repr::First)
    }

    pub fn is_last(&self) -> bool {
        matches!(self.0, Repr::Last)
    }
}

impl From<&str> for BindingKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for BindingKey {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl Display for BindingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Repr::First => f.write_str("<first>"),
            Repr::Name(name) => write!(f, "{name:?}"),
            Repr::Last => f.write_str("<last>"),
        }
    }
}

// On the wire a key is an optional name: absent means LAST. FIRST never travels.
impl Serialize for BindingKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.0 {
            Repr::Name(name) => serializer.serialize_some(&**name),
            Repr::Last => serializer.serialize_none(),
            Repr::First => Err(S::Error::custom("the FIRST binding key cannot be sent")),
        }
    }
}

impl<'de> Deserialize<'de> for BindingKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name: Option<String> = Option::deserialize(deserializer)?;
        Ok(match name {
            Some(name) => Self::new(name),
            None => Self::LAST,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn sentinels_bracket_names() {
        let names = ["", "a", "alice", "bob", "\u{0}", "\u{10000}"];
        for name in names {
            let key = BindingKey::new(name);
            assert!(BindingKey::FIRST < key, "{key}");
            assert!(key < BindingKey::LAST, "{key}");
        }
        assert!(BindingKey::FIRST < BindingKey::LAST);
    }

    #[test]
    fn orders_by_encoded_bytes() {
        let mut keys: Vec<BindingKey> = ["bob", "alice", "a", "b\u{e9}", "bz", ""]
            .into_iter()
            .map(BindingKey::from)
            .collect();
        keys.sort();
        let names: Vec<_> = keys.iter().map(|k| k.name().unwrap()).collect();
        assert_eq!(names, vec!["", "a", "alice", "bob", "bz", "b\u{e9}"]);
    }

    #[test]
    fn wire_form() {
        let alice = BindingKey::new("alice");
        assert_eq!(serde_json::to_string(&alice).unwrap(), "\"alice\"");
        assert_eq!(serde_json::to_string(&BindingKey::LAST).unwrap(), "null");
        assert!(serde_json::to_string(&BindingKey::FIRST).is_err());

        let last: BindingKey = serde_json::from_str("null").unwrap();
        assert!(last.is_last());
        let back: BindingKey = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(back, alice);
    }

    proptest! {
        #[test]
        fn order_matches_byte_order(a in ".*", b in ".*") {
            let ka = BindingKey::new(a.as_str());
            let kb = BindingKey::new(b.as_str());
            prop_assert_eq!(ka.cmp(&kb), a.as_bytes().cmp(b.as_bytes()));
            prop_assert_eq!(ka == kb, a == b);
        }
    }
}
