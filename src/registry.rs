//! The registration table: which callback services which descriptor and
//! direction.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::sys::Interest;
use crate::EventKind;

/// A registered readiness callback.
///
/// Stored behind `Arc` so a dispatch batch can finish invoking a callback
/// that a concurrent `remove_fd` has already dropped from the table.
pub(crate) type Callback = Arc<dyn Fn(RawFd, EventKind) + Send + Sync>;

/// Callback slots for one descriptor, one per direction.
#[derive(Default)]
struct Entry {
    read: Option<Callback>,
    write: Option<Callback>,
}

impl Entry {
    fn slot(&self, kind: EventKind) -> &Option<Callback> {
        match kind {
            EventKind::Read => &self.read,
            EventKind::Write => &self.write,
        }
    }

    fn slot_mut(&mut self, kind: EventKind) -> &mut Option<Callback> {
        match kind {
            EventKind::Read => &mut self.read,
            EventKind::Write => &mut self.write,
        }
    }

    fn interest(&self) -> Interest {
        Interest {
            read: self.read.is_some(),
            write: self.write.is_some(),
        }
    }
}

/// Table mapping descriptors to their registered callbacks.
///
/// Read and written only under the instance mutex. Entries with no occupied
/// slot are pruned, so the key set is exactly the watched set.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<RawFd, Entry>,
}

impl Registry {
    pub fn contains(&self, fd: RawFd, kind: EventKind) -> bool {
        self.entries
            .get(&fd)
            .map_or(false, |entry| entry.slot(kind).is_some())
    }

    /// Interest currently registered for `fd`, if the descriptor is known.
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.entries.get(&fd).map(Entry::interest)
    }

    pub fn insert(&mut self, fd: RawFd, kind: EventKind, callback: Callback) {
        *self.entries.entry(fd).or_default().slot_mut(kind) = Some(callback);
    }

    /// Drops the callback for `(fd, kind)` and prunes the entry if that was
    /// the last slot. Returns the interest remaining for `fd`.
    pub fn remove(&mut self, fd: RawFd, kind: EventKind) -> Interest {
        let remaining = match self.entries.get_mut(&fd) {
            Some(entry) => {
                entry.slot_mut(kind).take();
                entry.interest()
            }
            None => Interest::default(),
        };
        if remaining.is_empty() {
            self.entries.remove(&fd);
        }
        remaining
    }

    /// Clones the callback registered for `(fd, kind)`, if still present.
    pub fn callback(&self, fd: RawFd, kind: EventKind) -> Option<Callback> {
        self.entries.get(&fd).and_then(|entry| entry.slot(kind).clone())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("fds", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn last_slot_removal_prunes_the_entry() {
        let mut registry = Registry::default();
        registry.insert(3, EventKind::Read, noop());
        registry.insert(3, EventKind::Write, noop());

        let remaining = registry.remove(3, EventKind::Read);
        assert_eq!(
            remaining,
            Interest {
                read: false,
                write: true
            }
        );
        assert!(registry.interest(3).is_some());

        let remaining = registry.remove(3, EventKind::Write);
        assert!(remaining.is_empty());
        assert!(registry.interest(3).is_none());
    }

    #[test]
    fn remove_of_unknown_pair_reports_empty_interest() {
        let mut registry = Registry::default();
        assert!(registry.remove(7, EventKind::Read).is_empty());
        assert!(!registry.contains(7, EventKind::Read));
    }
}
