//! Bindings to the platform readiness facility.

use cfg_if::cfg_if;

use std::os::unix::io::RawFd;

use crate::EventKind;

#[cfg(unix)]
macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))] {
        mod epoll;
        pub(crate) use self::epoll::{Events, Poller};
    } else if #[cfg(unix)] {
        mod select;
        pub(crate) use self::select::{Events, Poller};
    } else {
        compile_error!("mux-io does not support this target OS");
    }
}

// The select back-end is portable by definition. Compile it under test on
// epoll hosts too, so its registration and capacity handling stay covered by
// a single CI target.
#[cfg(all(
    test,
    any(target_os = "linux", target_os = "android", target_os = "illumos")
))]
mod select;

/// The directions a descriptor is watched for.
///
/// This is the per-fd mask handed to a back-end, derived from the occupied
/// callback slots of the registration table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    /// Returns this interest extended by `kind`.
    pub fn with(mut self, kind: EventKind) -> Interest {
        match kind {
            EventKind::Read => self.read = true,
            EventKind::Write => self.write = true,
        }
        self
    }

    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// A single readiness report handed from a back-end to the dispatch loop.
///
/// Both flags may be set at once; the loop then resolves the report into up
/// to two callback invocations.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}
