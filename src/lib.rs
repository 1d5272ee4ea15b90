//! Callback-driven I/O readiness multiplexing.
//!
//! This crate watches file descriptors for readability and writability and
//! invokes a registered callback on the dispatch thread whenever the kernel
//! reports one ready. A [`Multiplexer`] owns the platform readiness facility
//! and a wakeup channel; one thread runs its dispatch loop via
//! [`Multiplexer::start`] while any number of other threads (or the callbacks
//! themselves) register, deregister, and stop it.
//!
//! Readiness is level-triggered. On Linux, Android and illumos the
//! multiplexer uses [epoll]; on other Unix systems it falls back to
//! [select], which limits descriptor numbers to the `FD_SETSIZE` of the
//! platform's C library.
//!
//! [epoll]: https://en.wikipedia.org/wiki/Epoll
//! [select]: https://en.wikipedia.org/wiki/Select_(Unix)
//!
//! # Examples
//!
//! Watch one end of a socket pair and stop the loop from the callback:
//!
//! ```
//! use mux_io::{EventKind, Multiplexer};
//! use std::io::Write;
//! use std::os::unix::io::AsRawFd;
//! use std::os::unix::net::UnixStream;
//! use std::thread;
//!
//! # fn main() -> std::io::Result<()> {
//! let mux = Multiplexer::new()?;
//! let (mut local, remote) = UnixStream::pair()?;
//!
//! let handle = mux.clone();
//! mux.add_fd(remote.as_raw_fd(), EventKind::Read, move |fd, kind| {
//!     println!("fd {} is {:?}-ready", fd, kind);
//!     handle.stop().unwrap();
//! })?;
//!
//! let runner = mux.clone();
//! let dispatch = thread::spawn(move || runner.start());
//! local.write_all(b"ping")?;
//! dispatch.join().unwrap()?;
//! # Ok(()) }
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod mux;
mod registry;
mod sys;

pub use mux::Multiplexer;

/// The readiness direction of a registration.
///
/// There is no combined kind: a descriptor watched for both directions is
/// registered twice, once per kind, each with its own callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A read on the descriptor will make progress without blocking.
    Read,
    /// A write on the descriptor will make progress without blocking.
    Write,
}
