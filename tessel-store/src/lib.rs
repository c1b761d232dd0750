//! The key-value store contract shared by column segments and distributed training runs.
//!
//! The store is an external collaborator: the core only relies on [`Store`]. [`MemStore`] is the
//! in-process implementation used by the single-process cluster and by tests.

use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;

pub use mem::*;
use tessel_error::TesselResult;

mod mem;

/// The identifier of a stored value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Arc<str>);

impl Key {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// A process-wide unique key, used to publish the state of a distributed run.
    pub fn random(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", uuid::Uuid::new_v4()).into())
    }

    /// Derive a key for the `index`th child of this key, e.g. the segments of a column.
    pub fn child(&self, index: usize) -> Self {
        Self(format!("{}/{index}", self.0).into())
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl Deref for Key {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

/// The node that is home to a key; the writer of record for everything published under it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u16);

impl NodeId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl From<u16> for NodeId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// A function run by [`Store::apply`] against the currently committed value.
///
/// Returning `Ok(None)` leaves the value untouched. The store may invoke the function more than
/// once if another writer commits in between, so it must not have side effects.
pub type ApplyFn<'a, V> = dyn FnMut(Option<&V>) -> TesselResult<Option<V>> + 'a;

pub trait Store<V>: Send + Sync {
    fn put(&self, key: Key, value: V);

    fn get(&self, key: &Key) -> Option<V>;

    fn remove(&self, key: &Key) -> Option<V>;

    /// Atomically replace the value under `key` with the result of `f`.
    ///
    /// Returns the value committed by this call, or the current value if `f` declined to update.
    fn apply(&self, key: &Key, f: &mut ApplyFn<'_, V>) -> TesselResult<Option<V>>;
}
