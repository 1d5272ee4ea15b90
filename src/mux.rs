//! The multiplexer façade and its dispatch loop.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::registry::{Callback, Registry};
use crate::sys::{Events, Interest, Poller};
use crate::EventKind;

/// A thread-safe I/O readiness multiplexer.
///
/// One instance owns a kernel readiness object and a wakeup channel. A
/// single thread drives the dispatch loop through [`start`]; any other
/// thread, including the registered callbacks themselves, may call
/// [`add_fd`], [`remove_fd`], [`stop`] and [`is_running`] concurrently.
///
/// The handle is cheaply cloneable and all clones refer to the same
/// instance, so a callback can capture a clone to deregister itself or stop
/// the loop. Multiple independent instances may coexist in one process.
///
/// Watched descriptors are borrowed, never owned: the caller must keep an fd
/// open until its registrations are removed. The kernel readiness the loop
/// reacts to is level-triggered, so a callback that leaves its descriptor
/// ready (for example, by not reading pending data) runs again on the next
/// iteration.
///
/// [`start`]: Multiplexer::start
/// [`add_fd`]: Multiplexer::add_fd
/// [`remove_fd`]: Multiplexer::remove_fd
/// [`stop`]: Multiplexer::stop
/// [`is_running`]: Multiplexer::is_running
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

struct Inner {
    /// Platform readiness watcher plus the wakeup channel.
    poller: Poller,
    /// Registered callbacks; the single source of truth for delivery.
    registry: Mutex<Registry>,
    /// Whether a thread is currently inside the dispatch loop.
    running: AtomicBool,
}

impl Multiplexer {
    /// Creates a multiplexer backed by the platform readiness facility.
    ///
    /// # Errors
    ///
    /// Fails if the kernel refuses to create the readiness object or the
    /// wakeup channel; the returned error carries the OS error code.
    pub fn new() -> io::Result<Multiplexer> {
        Ok(Multiplexer {
            inner: Arc::new(Inner {
                poller: Poller::new()?,
                registry: Mutex::new(Registry::default()),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Returns `true` while a thread is inside [`Multiplexer::start`].
    ///
    /// A single atomic load; never blocks.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Registers `callback` to run on the dispatch thread whenever `fd` is
    /// ready in direction `kind`.
    ///
    /// Idempotent: if `(fd, kind)` is already registered this returns
    /// `Ok(())` and keeps the existing callback. To watch a descriptor for
    /// both directions, register it once per [`EventKind`].
    ///
    /// A registration made while the loop is blocked becomes effective on
    /// its next iteration, which the internal wakeup makes imminent.
    ///
    /// # Errors
    ///
    /// Fails if the kernel rejects the registration (in which case nothing
    /// is recorded), on the select back-end if `fd` is at or beyond
    /// `FD_SETSIZE`, or if the wakeup write fails for a reason other than a
    /// saturated channel.
    pub fn add_fd<F>(&self, fd: RawFd, kind: EventKind, callback: F) -> io::Result<()>
    where
        F: Fn(RawFd, EventKind) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.lock().unwrap();
        if registry.contains(fd, kind) {
            return Ok(());
        }

        match registry.interest(fd) {
            Some(existing) => self.inner.poller.interest(fd, existing.with(kind))?,
            None => self.inner.poller.insert(fd, Interest::default().with(kind))?,
        }

        registry.insert(fd, kind, Arc::new(callback) as Callback);
        log::trace!("add_fd: fd={} kind={:?}", fd, kind);
        self.inner.poller.notify()
    }

    /// Deregisters the callback for `(fd, kind)`.
    ///
    /// Idempotent: if the pair is not registered this returns `Ok(())`. A
    /// registration removed while a dispatch batch is in flight may fire
    /// once more from that batch's snapshot; it fires no further.
    ///
    /// # Errors
    ///
    /// Fails if the kernel rejects the deregistration or if the wakeup
    /// write fails for a reason other than a saturated channel.
    pub fn remove_fd(&self, fd: RawFd, kind: EventKind) -> io::Result<()> {
        let mut registry = self.inner.registry.lock().unwrap();
        if !registry.contains(fd, kind) {
            return Ok(());
        }

        let remaining = registry.remove(fd, kind);
        if remaining.is_empty() {
            self.inner.poller.remove(fd)?;
        } else {
            self.inner.poller.interest(fd, remaining)?;
        }

        log::trace!("remove_fd: fd={} kind={:?}", fd, kind);
        self.inner.poller.notify()
    }

    /// Runs the dispatch loop on the calling thread until [`Multiplexer::stop`].
    ///
    /// Each iteration blocks in the kernel wait, resolves the reported
    /// readiness against the registration table under the mutex, then
    /// invokes the snapshotted callbacks with the mutex released, so
    /// callbacks may freely re-enter the instance. A signal interrupting
    /// the wait restarts it.
    ///
    /// At most one thread may be inside `start` per instance at a time;
    /// violating that is a contract error.
    ///
    /// # Errors
    ///
    /// Returns `Ok(())` once a `stop` request is observed. Any kernel wait
    /// failure other than a signal interruption is unrecoverable: the loop
    /// clears the running flag and propagates the error.
    pub fn start(&self) -> io::Result<()> {
        self.inner.running.store(true, Ordering::SeqCst);

        let mut events = Events::new();
        let mut batch: Vec<(RawFd, EventKind, Callback)> = Vec::new();

        while self.inner.running.load(Ordering::SeqCst) {
            log::trace!("dispatch: waiting on I/O");
            match self.inner.poller.wait(&mut events) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.inner.running.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }

            // Resolve kernel readiness against the table. A pair removed
            // since the kernel report is skipped here; a pair added after
            // this snapshot fires no earlier than the next iteration.
            {
                let registry = self.inner.registry.lock().unwrap();
                for event in events.iter() {
                    if event.readable {
                        if let Some(callback) = registry.callback(event.fd, EventKind::Read) {
                            batch.push((event.fd, EventKind::Read, callback));
                        }
                    }
                    if event.writable {
                        if let Some(callback) = registry.callback(event.fd, EventKind::Write) {
                            batch.push((event.fd, EventKind::Write, callback));
                        }
                    }
                }
            }

            log::trace!("dispatch: {} ready callbacks", batch.len());
            for (fd, kind, callback) in batch.drain(..) {
                callback(fd, kind);
            }
        }

        Ok(())
    }

    /// Requests the dispatch loop to exit.
    ///
    /// Idempotent, thread-safe and non-blocking: if the loop is not running
    /// this is a no-op. `stop` only performs an atomic swap and a wakeup
    /// write, so it is safe to call from a signal handler. The request is
    /// asynchronous: callbacks already snapshotted for the current batch
    /// may still run before `start` returns.
    ///
    /// # Errors
    ///
    /// Fails only if the wakeup write fails for a reason other than a
    /// saturated channel.
    pub fn stop(&self) -> io::Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.poller.notify()
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
