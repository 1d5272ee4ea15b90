//! A non-blocking TCP echo server driven by the multiplexer.
//!
//! Run with `cargo run --example echo-server`, talk to it with
//! `nc localhost 8080`, and stop it with Ctrl+C. Every connection is greeted,
//! then echoed back line by line; replies are queued per client and flushed
//! on write readiness.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, OnceLock};

use mux_io::{EventKind, Multiplexer};

const PORT: u16 = 8080;

/// Reachable from the signal handler. `Multiplexer::stop` only swaps an
/// atomic and writes the wakeup channel, both async-signal-safe.
static MUX: OnceLock<Multiplexer> = OnceLock::new();

unsafe extern "C" fn shutdown_handler(_signum: libc::c_int) {
    if let Some(mux) = MUX.get() {
        let _ = mux.stop();
    }
}

struct Client {
    stream: TcpStream,
    pending: Vec<u8>,
}

type ClientMap = Arc<Mutex<HashMap<RawFd, Client>>>;

fn main() -> io::Result<()> {
    env_logger::init();

    let mux = Multiplexer::new()?;
    MUX.set(mux.clone()).expect("main runs once");

    let handler: unsafe extern "C" fn(libc::c_int) = shutdown_handler;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    let listener = TcpListener::bind(("0.0.0.0", PORT))?;
    listener.set_nonblocking(true)?;
    let listener_fd = listener.as_raw_fd();
    println!("echo server listening on port {}", PORT);

    let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));

    let accept_mux = mux.clone();
    let accept_clients = clients.clone();
    mux.add_fd(listener_fd, EventKind::Read, move |_, _| loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("client {} connected", peer);
                if let Err(err) = serve_client(&accept_mux, &accept_clients, stream) {
                    log::warn!("client {} rejected: {}", peer, err);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                log::error!("accept failed: {}", err);
                break;
            }
        }
    })?;

    mux.start()?;
    println!("echo server shut down");
    Ok(())
}

fn serve_client(mux: &Multiplexer, clients: &ClientMap, stream: TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    let fd = stream.as_raw_fd();
    clients.lock().unwrap().insert(
        fd,
        Client {
            stream,
            pending: Vec::new(),
        },
    );

    let read_mux = mux.clone();
    let read_clients = clients.clone();
    if let Err(err) = mux.add_fd(fd, EventKind::Read, move |fd, _| {
        handle_read(&read_mux, &read_clients, fd);
    }) {
        clients.lock().unwrap().remove(&fd);
        return Err(err);
    }

    queue_reply(mux, clients, fd, b"Hello, World!\n");
    Ok(())
}

fn handle_read(mux: &Multiplexer, clients: &ClientMap, fd: RawFd) {
    let mut buf = [0u8; 1024];
    let result = match clients.lock().unwrap().get_mut(&fd) {
        Some(client) => client.stream.read(&mut buf),
        None => return,
    };

    match result {
        // Orderly shutdown by the peer.
        Ok(0) => disconnect(mux, clients, fd),
        Ok(n) => {
            let mut reply = b"Echo: ".to_vec();
            reply.extend_from_slice(&buf[..n]);
            queue_reply(mux, clients, fd, &reply);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
        Err(err) => {
            log::warn!("read from client failed: {}", err);
            disconnect(mux, clients, fd);
        }
    }
}

/// Appends to the client's output buffer and arms the write watch; the
/// registration is idempotent, so an already armed client is untouched.
fn queue_reply(mux: &Multiplexer, clients: &ClientMap, fd: RawFd, bytes: &[u8]) {
    match clients.lock().unwrap().get_mut(&fd) {
        Some(client) => client.pending.extend_from_slice(bytes),
        None => return,
    }

    let write_mux = mux.clone();
    let write_clients = clients.clone();
    let armed = mux.add_fd(fd, EventKind::Write, move |fd, _| {
        handle_write(&write_mux, &write_clients, fd);
    });
    if armed.is_err() {
        disconnect(mux, clients, fd);
    }
}

fn handle_write(mux: &Multiplexer, clients: &ClientMap, fd: RawFd) {
    let result = {
        let mut clients = clients.lock().unwrap();
        let Client { stream, pending } = match clients.get_mut(&fd) {
            Some(client) => client,
            None => return,
        };
        match stream.write(pending) {
            Ok(n) => {
                pending.drain(..n);
                Ok(pending.is_empty())
            }
            Err(err) => Err(err),
        }
    };

    match result {
        // Fully flushed; disarm the write watch until the next reply.
        Ok(true) => {
            if mux.remove_fd(fd, EventKind::Write).is_err() {
                disconnect(mux, clients, fd);
            }
        }
        Ok(false) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
        Err(err) => {
            log::warn!("write to client failed: {}", err);
            disconnect(mux, clients, fd);
        }
    }
}

fn disconnect(mux: &Multiplexer, clients: &ClientMap, fd: RawFd) {
    let _ = mux.remove_fd(fd, EventKind::Read);
    let _ = mux.remove_fd(fd, EventKind::Write);
    // Dropping the client closes the socket, after the registrations are
    // gone.
    if clients.lock().unwrap().remove(&fd).is_some() {
        log::info!("client disconnected");
    }
}
