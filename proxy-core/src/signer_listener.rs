// Copyright (C) 2024 Strangelove Ventures
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The signer-listener endpoint: one per accepted sentry connection.
//!
//! Grounded on `privval/signer_listener.go`. The Go source keeps one
//! `net.Conn` plus a mutex so that at most one sign request is ever
//! in flight on a given sentry connection, and drops back to "awaiting a
//! fresh connection" the moment anything goes wrong. We mirror that with
//! an explicit two-state machine and a single `Mutex` guarding the live
//! connection.

use std::io::{Read, Write};
use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::codec::{read_msg, write_msg, LISTENER_MAX_FRAME_SIZE};
use crate::error::ListenerError;
use crate::messages::{unwrap, wrap, Payload};
use crate::secret_connection::SecretConnection;

/// Read/write timeout applied to every accepted connection so a wedged
/// sentry cannot hang a dispatch thread forever.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `send_request` waits for a fresh connection to be accepted
/// before giving up, when none is currently held (spec.md §4.2: "the next
/// `SendRequestLocked` call blocks until a fresh connection is accepted (or
/// the caller times out)"). Callers that need a different bound can call
/// `send_request_timeout` directly.
const DEFAULT_CONNECTION_WAIT: Duration = Duration::from_secs(10);

enum Held<IO> {
    Idle,
    Connected(SecretConnection<IO>),
}

/// Accepts sentry connections on a single listen address and serializes
/// requests against whichever connection is currently live.
///
/// Generic over the accepted stream type so the same state machine serves
/// both TCP and Unix-domain listeners (spec.md §3, `Endpoint::Tcp` /
/// `Endpoint::Unix`).
pub struct SignerListenerEndpoint<IO> {
    held: Mutex<Held<IO>>,
    /// Signaled by `adopt()` and `stop()` so a caller blocked in
    /// `send_request_timeout` wakes as soon as a connection arrives (or
    /// shutdown is requested) instead of waiting out its full timeout.
    connected: Condvar,
    stopped: AtomicBool,
    max_frame_size: usize,
}

impl<IO: Read + Write + Send + 'static> SignerListenerEndpoint<IO> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(Held::Idle),
            connected: Condvar::new(),
            stopped: AtomicBool::new(false),
            max_frame_size: LISTENER_MAX_FRAME_SIZE,
        })
    }

    /// Installs a freshly handshaken connection, replacing whatever was
    /// previously held. Called by the accept loop once per incoming dial.
    pub fn adopt(&self, conn: SecretConnection<IO>) {
        let mut held = self.held.lock().expect("signer listener mutex poisoned");
        *held = Held::Connected(conn);
        self.connected.notify_all();
    }

    /// Sends `request` to whichever sentry connection is currently held and
    /// waits for its response. If no connection is currently held, blocks
    /// (up to `DEFAULT_CONNECTION_WAIT`) until one is accepted rather than
    /// failing immediately — see `send_request_timeout` for a caller-chosen
    /// bound. Only one caller's request is ever in flight: the lock is held
    /// for the full wait plus request/response round trip, matching the Go
    /// source's single-flight guarantee per sentry.
    pub fn send_request(&self, request: Payload) -> Result<Payload, ListenerError> {
        self.send_request_timeout(request, DEFAULT_CONNECTION_WAIT)
    }

    /// Same as `send_request`, but lets the caller choose how long to wait
    /// for a fresh connection when none is currently held.
    pub fn send_request_timeout(
        &self,
        request: Payload,
        wait_for_connection: Duration,
    ) -> Result<Payload, ListenerError> {
        let held = self.held.lock().expect("signer listener mutex poisoned");
        let (mut held, _timed_out) = self
            .connected
            .wait_timeout_while(held, wait_for_connection, |held| {
                matches!(held, Held::Idle) && !self.stopped.load(Ordering::SeqCst)
            })
            .expect("signer listener mutex poisoned");

        if self.stopped.load(Ordering::SeqCst) {
            return Err(ListenerError::Stopped);
        }
        let conn = match &mut *held {
            Held::Idle => return Err(ListenerError::NotConnected),
            Held::Connected(conn) => conn,
        };

        let wire = wrap(request);
        if let Err(e) = write_msg(conn, &wire) {
            *held = Held::Idle;
            return Err(ListenerError::Codec(e));
        }
        let response = match read_msg(conn, self.max_frame_size) {
            Ok(msg) => msg,
            Err(e) => {
                *held = Held::Idle;
                return Err(ListenerError::Codec(e));
            }
        };
        match unwrap(response) {
            Some(payload) => Ok(payload),
            None => {
                *held = Held::Idle;
                Err(ListenerError::NotConnected)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.held.lock().expect("mutex poisoned"), Held::Connected(_))
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut held = self.held.lock().expect("mutex poisoned");
        *held = Held::Idle;
        self.connected.notify_all();
    }
}

/// Runs the accept loop for a TCP listen address, handshaking each accepted
/// connection and handing it to `endpoint`. Blocks until `stopped` is set;
/// callers run this on its own thread per spec.md §5 ("each task has its own
/// thread").
pub fn serve_tcp(
    listener: TcpListener,
    endpoint: Arc<SignerListenerEndpoint<std::net::TcpStream>>,
    identity: Arc<ed25519_dalek::SigningKey>,
) {
    listener
        .set_nonblocking(false)
        .expect("listener must support blocking accept");
    for incoming in listener.incoming() {
        if endpoint.stopped.load(Ordering::SeqCst) {
            return;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = stream.set_read_timeout(Some(IO_TIMEOUT));
        let _ = stream.set_write_timeout(Some(IO_TIMEOUT));
        match SecretConnection::new(stream, &identity) {
            Ok(conn) => {
                info!("sentry connection established");
                endpoint.adopt(conn);
            }
            Err(e) => warn!(error = %e, "secret connection handshake failed"),
        }
    }
}

#[cfg(unix)]
pub fn serve_unix(
    listener: UnixListener,
    endpoint: Arc<SignerListenerEndpoint<std::os::unix::net::UnixStream>>,
    identity: Arc<ed25519_dalek::SigningKey>,
) {
    for incoming in listener.incoming() {
        if endpoint.stopped.load(Ordering::SeqCst) {
            return;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        match SecretConnection::new(stream, &identity) {
            Ok(conn) => {
                info!("sentry connection established");
                endpoint.adopt(conn);
            }
            Err(e) => warn!(error = %e, "secret connection handshake failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::thread;
    use std::time::Instant;

    /// An in-memory duplex stream used to exercise the endpoint state
    /// machine without a real socket or handshake.
    #[derive(Default)]
    struct LoopbackIo {
        inbound: Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl Read for LoopbackIo {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }
    impl Write for LoopbackIo {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn idle_endpoint_blocks_then_times_out() {
        let endpoint: Arc<SignerListenerEndpoint<LoopbackIo>> = SignerListenerEndpoint::new();
        assert!(!endpoint.is_connected());
        let started = Instant::now();
        let err = endpoint
            .send_request_timeout(Payload::PingRequest, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, ListenerError::NotConnected));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn stop_clears_held_connection_and_future_sends() {
        let endpoint: Arc<SignerListenerEndpoint<LoopbackIo>> = SignerListenerEndpoint::new();
        endpoint.stop();
        let err = endpoint
            .send_request_timeout(Payload::PingRequest, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, ListenerError::Stopped));
    }

    #[test]
    fn blocked_send_wakes_promptly_on_stop_instead_of_waiting_out_the_timeout() {
        let endpoint: Arc<SignerListenerEndpoint<LoopbackIo>> = SignerListenerEndpoint::new();
        let stopper = endpoint.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });

        let started = Instant::now();
        let err = endpoint
            .send_request_timeout(Payload::PingRequest, Duration::from_secs(5))
            .unwrap_err();
        handle.join().expect("stopper thread panicked");

        assert!(matches!(err, ListenerError::Stopped));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
