//! Raw bindings to epoll (Linux, Android, illumos).

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::sys::{Event, Interest};

/// Maximum number of readiness reports accepted from the kernel per wait.
const EVENT_BATCH: usize = 1024;

/// Epoll-backed readiness watcher plus its eventfd wakeup channel.
///
/// The eventfd's read side is registered with the epoll instance for the
/// watcher's whole lifetime and is drained inside [`Poller::wait`]; it is
/// never reported to the caller.
pub(crate) struct Poller {
    epoll_fd: RawFd,
    event_fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let event_fd = match syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)) {
            Ok(fd) => fd,
            Err(err) => {
                let _ = syscall!(close(epoll_fd));
                return Err(err);
            }
        };

        // From here on `Drop` closes both descriptors on failure.
        let poller = Poller { epoll_fd, event_fd };
        poller.insert(
            event_fd,
            Interest {
                read: true,
                write: false,
            },
        )?;
        Ok(poller)
    }

    /// Registers a descriptor that is new to the kernel watch set.
    pub fn insert(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask(interest),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev))?;
        Ok(())
    }

    /// Replaces the interest mask of an already registered descriptor.
    pub fn interest(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask(interest),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev))?;
        Ok(())
    }

    /// Removes a descriptor from the kernel watch set.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.epoll_fd,
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))?;
        Ok(())
    }

    /// Blocks until at least one descriptor is ready.
    ///
    /// A signal arriving mid-wait surfaces as `ErrorKind::Interrupted`; the
    /// caller retries. If the wakeup channel is among the ready descriptors
    /// its accumulated count is drained here.
    pub fn wait(&self, events: &mut Events) -> io::Result<usize> {
        let res = syscall!(epoll_wait(
            self.epoll_fd,
            events.list.as_mut_ptr(),
            events.list.len() as libc::c_int,
            -1,
        ))?;
        events.len = res as usize;
        events.wakeup = self.event_fd;

        if events.list[..events.len]
            .iter()
            .any(|ev| ev.u64 == self.event_fd as u64)
        {
            let mut buf = [0u8; 8];
            let _ = syscall!(read(
                self.event_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len()
            ));
        }

        Ok(events.len)
    }

    /// Makes the current (or next) wait return promptly.
    ///
    /// A saturated counter reports `WouldBlock`; the wait will return anyway,
    /// so that counts as success.
    pub fn notify(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall!(write(
            self.event_fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = syscall!(close(self.event_fd));
        let _ = syscall!(close(self.epoll_fd));
    }
}

fn mask(interest: Interest) -> u32 {
    let mut events: libc::c_int = 0;
    if interest.read {
        events |= libc::EPOLLIN;
    }
    if interest.write {
        events |= libc::EPOLLOUT;
    }
    events as u32
}

/// Kernel readiness reports from one wait call.
pub(crate) struct Events {
    list: Box<[libc::epoll_event]>,
    len: usize,
    wakeup: RawFd,
}

impl Events {
    pub fn new() -> Events {
        let ev = libc::epoll_event { events: 0, u64: 0 };
        Events {
            list: vec![ev; EVENT_BATCH].into_boxed_slice(),
            len: 0,
            wakeup: -1,
        }
    }

    /// Reports from the last wait, with the wakeup channel filtered out.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        let wakeup = self.wakeup;
        self.list[..self.len]
            .iter()
            .filter(move |ev| ev.u64 as RawFd != wakeup)
            .map(|ev| Event {
                fd: ev.u64 as RawFd,
                readable: ev.events as libc::c_int & libc::EPOLLIN != 0,
                writable: ev.events as libc::c_int & libc::EPOLLOUT != 0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn notify_unblocks_wait_without_user_events() {
        let poller = Poller::new().unwrap();
        poller.notify().unwrap();

        let mut events = Events::new();
        let reported = poller.wait(&mut events).unwrap();
        assert!(reported >= 1);
        assert_eq!(events.iter().count(), 0);
    }

    #[test]
    fn readable_descriptor_is_reported() {
        let poller = Poller::new().unwrap();
        let (r, w) = pipe();
        poller
            .insert(
                r,
                Interest {
                    read: true,
                    write: false,
                },
            )
            .unwrap();

        assert_eq!(
            unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );

        let mut events = Events::new();
        poller.wait(&mut events).unwrap();
        let event = events.iter().find(|ev| ev.fd == r).unwrap();
        assert!(event.readable);
        assert!(!event.writable);

        poller.remove(r).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn saturating_notify_is_not_an_error() {
        let poller = Poller::new().unwrap();
        // Fill the eventfd counter to its ceiling of u64::MAX - 1, so the
        // following notify gets would-block from the kernel.
        let buf: [u8; 8] = (u64::MAX - 1).to_ne_bytes();
        let written = unsafe {
            libc::write(
                poller.event_fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        assert_eq!(written, 8);
        poller.notify().unwrap();
    }
}
