//! Raw bindings to select(2) with a self-pipe wakeup channel (POSIX
//! fallback).

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Mutex;

use crate::sys::{Event, Interest};

/// Select-backed readiness watcher.
///
/// `select` scans descriptors up to a compile-time limit, so registration
/// refuses anything numbered at or beyond `FD_SETSIZE`. The self-pipe's read
/// end sits in the read set for the watcher's whole lifetime and is drained
/// inside [`Poller::wait`].
pub(crate) struct Poller {
    wakeup_read: RawFd,
    wakeup_write: RawFd,
    sets: Mutex<Sets>,
}

struct Sets {
    read_set: libc::fd_set,
    write_set: libc::fd_set,
    /// Interest per registered descriptor. The greatest key bounds the
    /// descriptor range handed to `select`.
    interests: BTreeMap<RawFd, Interest>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let mut pipe_fds = [0 as RawFd; 2];
        syscall!(pipe(pipe_fds.as_mut_ptr()))?;

        // From here on `Drop` closes both pipe ends on failure.
        let poller = Poller {
            wakeup_read: pipe_fds[0],
            wakeup_write: pipe_fds[1],
            sets: Mutex::new(Sets {
                read_set: empty_set(),
                write_set: empty_set(),
                interests: BTreeMap::new(),
            }),
        };
        for fd in pipe_fds {
            prepare_wakeup_fd(fd)?;
        }

        let mut sets = poller.sets.lock().unwrap();
        unsafe { libc::FD_SET(poller.wakeup_read, &mut sets.read_set) };
        drop(sets);

        Ok(poller)
    }

    /// Registers a descriptor that is new to the watch set.
    pub fn insert(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        check_capacity(fd)?;
        let mut sets = self.sets.lock().unwrap();
        if interest.read {
            unsafe { libc::FD_SET(fd, &mut sets.read_set) };
        }
        if interest.write {
            unsafe { libc::FD_SET(fd, &mut sets.write_set) };
        }
        sets.interests.insert(fd, interest);
        Ok(())
    }

    /// Replaces the interest mask of an already registered descriptor.
    pub fn interest(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        check_capacity(fd)?;
        let mut sets = self.sets.lock().unwrap();
        let Sets {
            read_set,
            write_set,
            interests,
        } = &mut *sets;
        unsafe {
            if interest.read {
                libc::FD_SET(fd, read_set);
            } else {
                libc::FD_CLR(fd, read_set);
            }
            if interest.write {
                libc::FD_SET(fd, write_set);
            } else {
                libc::FD_CLR(fd, write_set);
            }
        }
        interests.insert(fd, interest);
        Ok(())
    }

    /// Removes a descriptor from the watch set.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let mut sets = self.sets.lock().unwrap();
        unsafe {
            libc::FD_CLR(fd, &mut sets.read_set);
            libc::FD_CLR(fd, &mut sets.write_set);
        }
        sets.interests.remove(&fd);
        Ok(())
    }

    /// Blocks until at least one descriptor is ready.
    ///
    /// The bitsets are copied under the lock and handed to the kernel
    /// without it, so registrations may change while the wait is blocked;
    /// the dispatch loop re-checks its table before delivering. A signal
    /// arriving mid-wait surfaces as `ErrorKind::Interrupted`.
    pub fn wait(&self, events: &mut Events) -> io::Result<usize> {
        events.list.clear();

        let (mut read_set, mut write_set, max_fd, candidates) = {
            let sets = self.sets.lock().unwrap();
            let max_fd = sets
                .interests
                .keys()
                .next_back()
                .copied()
                .unwrap_or(-1)
                .max(self.wakeup_read);
            let candidates: Vec<(RawFd, Interest)> = sets
                .interests
                .iter()
                .map(|(&fd, &interest)| (fd, interest))
                .collect();
            (sets.read_set, sets.write_set, max_fd, candidates)
        };

        syscall!(select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            ptr::null_mut(),
            ptr::null_mut(),
        ))?;

        if unsafe { libc::FD_ISSET(self.wakeup_read, &mut read_set) } {
            self.drain();
        }

        for (fd, interest) in candidates {
            let readable = interest.read && unsafe { libc::FD_ISSET(fd, &mut read_set) };
            let writable = interest.write && unsafe { libc::FD_ISSET(fd, &mut write_set) };
            if readable || writable {
                events.list.push(Event {
                    fd,
                    readable,
                    writable,
                });
            }
        }
        Ok(events.list.len())
    }

    /// Makes the current (or next) wait return promptly.
    ///
    /// A full pipe reports `WouldBlock`; the wait will return anyway, so
    /// that counts as success.
    pub fn notify(&self) -> io::Result<()> {
        let buf = [1u8];
        match syscall!(write(
            self.wakeup_write,
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while matches!(
            syscall!(read(
                self.wakeup_read,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len()
            )),
            Ok(n) if n > 0
        ) {}
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = syscall!(close(self.wakeup_read));
        let _ = syscall!(close(self.wakeup_write));
    }
}

fn empty_set() -> libc::fd_set {
    let mut set = unsafe { mem::zeroed::<libc::fd_set>() };
    unsafe { libc::FD_ZERO(&mut set) };
    set
}

fn check_capacity(fd: RawFd) -> io::Result<()> {
    if fd < 0 || fd as usize >= libc::FD_SETSIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor outside the select() fd_set range",
        ));
    }
    Ok(())
}

/// Both ends of the self-pipe must never block the dispatch loop or leak
/// into spawned children.
fn prepare_wakeup_fd(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    Ok(())
}

/// Kernel readiness reports from one wait call.
pub(crate) struct Events {
    list: Vec<Event>,
}

impl Events {
    pub fn new() -> Events {
        Events { list: Vec::new() }
    }

    /// Reports from the last wait; the wakeup channel is never among them.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.list.iter().copied()
    }
}
