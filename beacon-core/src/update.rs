//! Address membership updates and the diff engine that produces them.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Address joined the service.
    Add,

    /// Address left the service.
    Delete,
}

/// One membership change for a resolved service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Update {
    /// What happened to the address.
    pub op: Op,

    /// The `host:port` address concerned.
    pub addr: String,
}

impl Update {
    /// Create an `Add` update.
    #[must_use]
    pub fn add(addr: impl Into<String>) -> Self {
        Self {
            op: Op::Add,
            addr: addr.into(),
        }
    }

    /// Create a `Delete` update.
    #[must_use]
    pub fn delete(addr: impl Into<String>) -> Self {
        Self {
            op: Op::Delete,
            addr: addr.into(),
        }
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Op::Add => write!(f, "+{}", self.addr),
            Op::Delete => write!(f, "-{}", self.addr),
        }
    }
}

/// Opaque store position marking the last observed state.
///
/// Passed back to the store on the next blocking query so that it only
/// answers once something newer happened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchCursor(u64);

impl WatchCursor {
    /// No state observed yet.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw store index.
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Raw store index.
    #[must_use]
    pub const fn index(self) -> u64 {
        self.0
    }

    /// Check if this cursor has observed anything.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for WatchCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the updates turning `prev` into `curr`.
///
/// Every address of `prev` missing from `curr` yields a `Delete`, followed by
/// an `Add` for every address of `curr` missing from `prev`. Each group keeps
/// input order and an address repeated within one input yields one event.
///
/// ```rust
/// use beacon_core::{Update, diff};
///
/// let prev = ["a:1".to_string(), "b:2".to_string()];
/// let curr = ["b:2".to_string(), "c:3".to_string()];
///
/// assert_eq!(diff(&prev, &curr), vec![Update::delete("a:1"), Update::add("c:3")]);
/// assert!(diff(&prev, &prev).is_empty());
/// ```
#[must_use]
pub fn diff<S: AsRef<str>>(prev: &[S], curr: &[S]) -> Vec<Update> {
    let prev_set: HashSet<&str> = prev.iter().map(AsRef::as_ref).collect();
    let curr_set: HashSet<&str> = curr.iter().map(AsRef::as_ref).collect();

    let mut emitted = HashSet::new();
    let mut updates = Vec::new();

    for addr in prev.iter().map(AsRef::as_ref) {
        if !curr_set.contains(addr) && emitted.insert(addr) {
            updates.push(Update::delete(addr));
        }
    }

    for addr in curr.iter().map(AsRef::as_ref) {
        if !prev_set.contains(addr) && emitted.insert(addr) {
            updates.push(Update::add(addr));
        }
    }

    updates
}

/// The resolved view of a service: a set of `host:port` strings.
///
/// Load balancers mirror a watcher's state by applying every batch it
/// returns, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addrs: BTreeSet<String>,
}

impl AddressSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch of updates.
    pub fn apply(&mut self, updates: &[Update]) {
        for update in updates {
            match update.op {
                Op::Add => {
                    self.addrs.insert(update.addr.clone());
                }
                Op::Delete => {
                    self.addrs.remove(&update.addr);
                }
            }
        }
    }

    /// Check membership.
    #[must_use]
    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.contains(addr)
    }

    /// Number of addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Check if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Iterate over addresses in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addrs.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for AddressSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            addrs: iter.into_iter().map(Into::into).collect(),
        }
    }
}
