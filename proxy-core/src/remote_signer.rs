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

//! Per-sentry dial-serve loop. One `ReconnectingRemoteSigner` exists for
//! each sentry address; it dials out, handshakes, reads one privval request
//! at a time off the connection, forwards it to the horcrux connection, and
//! writes back the response — reconnecting on any failure.
//!
//! Grounded directly on `signer/remote_signer.go`. Notably this proxy
//! *dials* sentries rather than listening for them: sentries run the
//! listening side of the privval protocol, matching CometBFT's own
//! `PrivValidatorListenAddr` configuration, and horcrux-shaped signers dial
//! in. `signer_listener`/`SignerListenerEndpoint` is the inverse role, used
//! when this proxy is itself the one being dialed (the `--listen` flags in
//! spec.md §6 rather than `--sentry`).

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::addr::{Dialed, SentryAddr};
use crate::codec::{read_msg, write_msg, DEFAULT_MAX_FRAME_SIZE};
use crate::error::ClientError;
use crate::horcrux_connection::HorcruxConnection;
use crate::identity;
use crate::messages::{unwrap, wrap};
use crate::secret_connection::SecretConnection;

/// Matches the Go source's `const sleep = 1`. spec.md requires sentries see
/// a signer attempt within 3 seconds of the proxy coming up; a fixed 1s
/// retry (not exponential backoff) satisfies that on the very first dial.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Handshaking,
    Serving,
    Stopping,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
    stop_requested: AtomicBool,
}

/// Dials `address`, maintains the connection, and services privval
/// requests against `horcrux_connection` for as long as it is running.
pub struct ReconnectingRemoteSigner {
    address: SentryAddr,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    max_read_size: usize,
}

impl ReconnectingRemoteSigner {
    pub fn new(address: SentryAddr, horcrux_connection: Arc<dyn HorcruxConnection>) -> Arc<Self> {
        Self::with_max_read_size(address, horcrux_connection, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_read_size(
        address: SentryAddr,
        horcrux_connection: Arc<dyn HorcruxConnection>,
        max_read_size: usize,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Disconnected),
            condvar: Condvar::new(),
            stop_requested: AtomicBool::new(false),
        });
        let signer = Arc::new(Self {
            address,
            shared,
            handle: Mutex::new(None),
            max_read_size,
        });
        let run_signer = signer.clone();
        let handle = thread::Builder::new()
            .name(format!("remote-signer:{}", run_signer.address))
            .spawn(move || run_signer.run(horcrux_connection))
            .expect("failed to spawn remote signer thread");
        *signer.handle.lock().expect("handle mutex poisoned") = Some(handle);
        signer
    }

    pub fn address(&self) -> &SentryAddr {
        &self.address
    }

    pub fn state(&self) -> State {
        *self.shared.state.lock().expect("state mutex poisoned")
    }

    fn set_state(&self, state: State) {
        let mut guard = self.shared.state.lock().expect("state mutex poisoned");
        *guard = state;
        self.shared.condvar.notify_all();
    }

    fn should_stop(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
    }

    /// Requests shutdown and blocks until the dial-serve thread exits.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.set_state(State::Stopping);
        if let Some(handle) = self.handle.lock().expect("handle mutex poisoned").take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>, horcrux_connection: Arc<dyn HorcruxConnection>) {
        let identity_key = identity::generate();

        while !self.should_stop() {
            self.set_state(State::Disconnected);
            let stream = match self.dial() {
                Some(stream) => stream,
                None => continue,
            };

            if self.should_stop() {
                return;
            }

            self.set_state(State::Handshaking);
            let conn = match SecretConnection::new(stream, &identity_key) {
                Ok(conn) => conn,
                Err(e) => {
                    error!(address = %self.address, error = %e, "secret connection handshake failed");
                    self.sleep_before_retry();
                    continue;
                }
            };

            info!(address = %self.address, "connected to sentry");
            self.set_state(State::Serving);
            self.serve(conn, &horcrux_connection);
        }
    }

    fn dial(&self) -> Option<Dialed> {
        loop {
            if self.should_stop() {
                return None;
            }
            match self.address.dial(DIAL_TIMEOUT) {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    warn!(address = %self.address, error = %e, "dialing sentry failed, retrying");
                    self.sleep_before_retry();
                }
            }
        }
    }

    fn sleep_before_retry(&self) {
        thread::sleep(RETRY_INTERVAL);
    }

    /// Services one connection until a frame-level error forces a
    /// reconnect. Shutdown is re-checked before every blocking read so
    /// `stop()` doesn't have to wait out an in-flight request.
    fn serve<IO: Read + Write>(&self, mut conn: SecretConnection<IO>, horcrux_connection: &Arc<dyn HorcruxConnection>) {
        while !self.should_stop() {
            let request = match read_msg(&mut conn, self.max_read_size) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(address = %self.address, error = %e, "reading request failed, reconnecting");
                    return;
                }
            };

            let payload = match unwrap(request) {
                Some(payload) => payload,
                None => {
                    warn!(address = %self.address, "received empty message, reconnecting");
                    return;
                }
            };

            let response = match horcrux_connection.send_request(payload) {
                Ok(response) => response,
                Err(ClientError::NoEndpoints) => {
                    error!(address = %self.address, "no horcrux endpoints available, reconnecting");
                    return;
                }
                Err(e) => {
                    error!(address = %self.address, error = %e, "handling request failed, reconnecting");
                    return;
                }
            };

            if let Err(e) = write_msg(&mut conn, &wrap(response)) {
                warn!(address = %self.address, error = %e, "writing response failed, reconnecting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Payload;

    struct AlwaysPong;
    impl HorcruxConnection for AlwaysPong {
        fn send_request(&self, _request: Payload) -> Result<Payload, ClientError> {
            Ok(Payload::PingResponse)
        }
    }

    #[test]
    fn starts_disconnected_and_stops_cleanly() {
        let address = SentryAddr::parse("tcp://127.0.0.1:0").unwrap();
        let signer = ReconnectingRemoteSigner::new(address, Arc::new(AlwaysPong));
        // The dial loop will spin retrying against a closed port; stop()
        // must still return promptly rather than wait out a retry.
        signer.stop();
        assert_eq!(signer.state(), State::Stopping);
    }
}
