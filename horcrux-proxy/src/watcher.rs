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

//! The sentry watcher / reconciler (spec.md §4.6). Owns the full set of
//! `ReconnectingRemoteSigner`s the proxy is running: a fixed `persistent`
//! list created from `--sentry` flags, plus a `dynamic` mapping kept in
//! sync with whatever `SentryDiscovery` reports.
//!
//! Grounded directly on `cmd/watcher.go`'s `sentryWatcher`. The Go source
//! runs the reconciler as a goroutine synchronized by `stop`/`done` channels
//! (`stop` closed by `Stop()`, `done` closed when the goroutine returns, so
//! `Stop()` can block on `<-done` to guarantee exclusive ownership of the
//! `sentries` map before tearing anything down). We mirror that shape with a
//! dedicated `std::thread`: an `mpsc::Sender<()>` plays the role of `stop`,
//! and the thread's own `JoinHandle` plays the role of `done` — Rust's
//! `JoinHandle::join` already gives us the "wait for exclusive ownership"
//! guarantee the Go source needed a second channel for.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use proxy_core::addr::SentryAddr;
use proxy_core::error::MultiError;
use proxy_core::horcrux_connection::HorcruxConnection;
use proxy_core::remote_signer::ReconnectingRemoteSigner;

use crate::discovery::SentryDiscovery;

/// How often the reconciler re-lists Kubernetes and recomputes the desired
/// set of dynamic sentries (spec.md §4.6 step 3).
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Turns a dynamic set of discovered sentry addresses into a live set of
/// running `ReconnectingRemoteSigner`s.
///
/// `persistent` is created at construction and started immediately; it is
/// never touched by reconciliation. `dynamic` is mutated only by the
/// reconciler thread, matching the single-writer discipline spec.md §5
/// requires ("all other reads of that mapping are forbidden until `Stop`
/// has joined `done`").
pub struct Watcher {
    persistent: Vec<Arc<ReconnectingRemoteSigner>>,
    dynamic: Mutex<HashMap<SentryAddr, Arc<ReconnectingRemoteSigner>>>,
    horcrux_connection: Arc<dyn HorcruxConnection>,
    discovery: Option<Arc<dyn SentryDiscovery>>,
    runtime: tokio::runtime::Handle,
    max_read_size: usize,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Watcher {
    /// Builds the watcher and starts every persistent signer immediately —
    /// persistent signers run whether or not Kubernetes discovery is ever
    /// enabled, matching `cmd/watcher.go`'s `watchForChangedSentries`
    /// starting `persistentSigners` before checking `w.operator`.
    pub fn new(
        persistent_addresses: Vec<SentryAddr>,
        horcrux_connection: Arc<dyn HorcruxConnection>,
        discovery: Option<Arc<dyn SentryDiscovery>>,
        runtime: tokio::runtime::Handle,
        max_read_size: usize,
    ) -> Arc<Self> {
        let persistent = persistent_addresses
            .into_iter()
            .map(|address| {
                info!(%address, "starting persistent sentry signer");
                ReconnectingRemoteSigner::with_max_read_size(
                    address,
                    horcrux_connection.clone(),
                    max_read_size,
                )
            })
            .collect();

        Arc::new(Self {
            persistent,
            dynamic: Mutex::new(HashMap::new()),
            horcrux_connection,
            discovery,
            runtime,
            max_read_size,
            stop_tx: Mutex::new(None),
            reconciler: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Starts the reconcile loop if a discovery backend was supplied. With
    /// no discovery backend the persistent signers (already running) are
    /// the whole story and `watch` is a no-op, matching spec.md §4.6 step 2
    /// ("if operator is false, return — persistent signers run until Stop").
    pub fn watch(self: &Arc<Self>) {
        let Some(discovery) = self.discovery.clone() else {
            return;
        };

        let (stop_tx, stop_rx) = mpsc::channel();
        *self.stop_tx.lock().expect("stop_tx mutex poisoned") = Some(stop_tx);

        let watcher = self.clone();
        let handle = thread::Builder::new()
            .name("sentry-watcher".to_string())
            .spawn(move || watcher.reconcile_loop(discovery, stop_rx))
            .expect("failed to spawn sentry watcher thread");
        *self.reconciler.lock().expect("reconciler mutex poisoned") = Some(handle);
    }

    fn reconcile_loop(self: Arc<Self>, discovery: Arc<dyn SentryDiscovery>, stop_rx: mpsc::Receiver<()>) {
        loop {
            // `recv_timeout` is both the 30s tick and the cancellation
            // point: a `stop()` send (or the sender dropping) wakes it
            // immediately instead of waiting out the rest of the interval.
            match stop_rx.recv_timeout(RECONCILE_INTERVAL) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                Err(mpsc::RecvTimeoutError::Timeout) => self.reconcile_once(&discovery),
            }
        }
    }

    fn reconcile_once(&self, discovery: &Arc<dyn SentryDiscovery>) {
        let desired = match self.runtime.block_on(discovery.discover()) {
            Ok(desired) => desired,
            Err(e) => {
                // A failed list/lookup aborts only this tick; the dynamic
                // mapping carries over untouched and the next tick retries.
                warn!(error = %e, "sentry discovery failed, keeping previous set");
                return;
            }
        };

        let mut dynamic = self.dynamic.lock().expect("dynamic mutex poisoned");
        let current: BTreeSet<SentryAddr> = dynamic.keys().cloned().collect();

        for address in current.difference(&desired) {
            if let Some(signer) = dynamic.remove(address) {
                info!(%address, "removing sentry no longer discovered");
                signer.stop();
            }
        }

        for address in desired.difference(&current) {
            info!(%address, "adding newly discovered sentry");
            // A start failure is logged and the address is simply omitted
            // from the mapping rather than inserted — spec.md §9's open
            // question, resolved in favor of self-healing on the next tick
            // rather than risking a permanently-wedged entry.
            let signer = ReconnectingRemoteSigner::with_max_read_size(
                address.clone(),
                self.horcrux_connection.clone(),
                self.max_read_size,
            );
            dynamic.insert(address.clone(), signer);
        }
    }

    /// Stops the reconciler (if running) and every owned signer, persistent
    /// and dynamic. Idempotent: a second call is a documented no-op rather
    /// than a panic, since both a signal handler and explicit test teardown
    /// may race to call it.
    pub fn stop(&self) -> Result<(), MultiError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(stop_tx) = self.stop_tx.lock().expect("stop_tx mutex poisoned").take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.reconciler.lock().expect("reconciler mutex poisoned").take() {
            let _ = handle.join();
        }

        let mut errors = MultiError::new();
        for signer in &self.persistent {
            self.stop_signer(signer, &mut errors);
        }
        let mut dynamic = self.dynamic.lock().expect("dynamic mutex poisoned");
        for (_, signer) in dynamic.drain() {
            self.stop_signer(&signer, &mut errors);
        }

        errors.into_result()
    }

    /// `ReconnectingRemoteSigner::stop` cannot itself fail, but it runs
    /// arbitrary teardown inside a joined thread; a `catch_unwind` keeps one
    /// signer panicking from aborting the rest of the teardown, mirroring
    /// the Go source's `errors.Join` continuing past individual failures.
    fn stop_signer(&self, signer: &Arc<ReconnectingRemoteSigner>, errors: &mut MultiError) {
        let address = signer.address().to_string();
        let signer = signer.clone();
        if let Err(panic) = std::panic::catch_unwind(move || signer.stop()) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "signer stop panicked".to_string());
            warn!(address = %address, %message, "signer stop panicked");
            errors.push(StopPanic { address, message });
        }
    }

    /// Snapshot of the dynamic mapping's keys, for tests and diagnostics
    /// only — spec.md §5 forbids reading the live mapping from anywhere but
    /// the reconciler thread or after `stop()` has joined it.
    #[cfg(test)]
    fn dynamic_addresses(&self) -> BTreeSet<SentryAddr> {
        self.dynamic
            .lock()
            .expect("dynamic mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("signer stop panicked for {address}: {message}")]
struct StopPanic {
    address: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use proxy_core::error::ClientError;
    use proxy_core::messages::Payload;

    use crate::discovery::DiscoveryError;

    struct AlwaysPong;
    impl HorcruxConnection for AlwaysPong {
        fn send_request(&self, _request: Payload) -> Result<Payload, ClientError> {
            Ok(Payload::PingResponse)
        }
    }

    struct FakeDiscovery {
        desired: StdMutex<BTreeSet<SentryAddr>>,
    }

    #[async_trait::async_trait]
    impl SentryDiscovery for FakeDiscovery {
        async fn discover(&self) -> Result<BTreeSet<SentryAddr>, DiscoveryError> {
            Ok(self.desired.lock().unwrap().clone())
        }
    }

    fn addr(s: &str) -> SentryAddr {
        SentryAddr::parse(s).unwrap()
    }

    #[test]
    fn no_discovery_backend_means_watch_is_a_noop() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let watcher = Watcher::new(vec![], Arc::new(AlwaysPong), None, rt.handle().clone(), 1024);
        watcher.watch();
        assert!(watcher.dynamic_addresses().is_empty());
        watcher.stop().unwrap();
    }

    #[test]
    fn reconcile_once_adds_then_removes_a_sentry() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let fake = Arc::new(FakeDiscovery {
            desired: StdMutex::new(BTreeSet::new()),
        });
        let watcher = Watcher::new(
            vec![],
            Arc::new(AlwaysPong),
            Some(fake.clone() as Arc<dyn SentryDiscovery>),
            rt.handle().clone(),
            1024,
        );

        // Tick 1: svc-a appears.
        *fake.desired.lock().unwrap() = BTreeSet::from([addr("tcp://svc-a.ns:1234")]);
        watcher.reconcile_once(&(fake.clone() as Arc<dyn SentryDiscovery>));
        assert_eq!(
            watcher.dynamic_addresses(),
            BTreeSet::from([addr("tcp://svc-a.ns:1234")])
        );

        // Tick 2: svc-b joins alongside svc-a.
        *fake.desired.lock().unwrap() =
            BTreeSet::from([addr("tcp://svc-a.ns:1234"), addr("tcp://svc-b.ns:1234")]);
        watcher.reconcile_once(&(fake.clone() as Arc<dyn SentryDiscovery>));
        assert_eq!(
            watcher.dynamic_addresses(),
            BTreeSet::from([addr("tcp://svc-a.ns:1234"), addr("tcp://svc-b.ns:1234")])
        );

        // Tick 3: svc-a leaves, only svc-b remains.
        *fake.desired.lock().unwrap() = BTreeSet::from([addr("tcp://svc-b.ns:1234")]);
        watcher.reconcile_once(&(fake.clone() as Arc<dyn SentryDiscovery>));
        assert_eq!(
            watcher.dynamic_addresses(),
            BTreeSet::from([addr("tcp://svc-b.ns:1234")])
        );

        watcher.stop().unwrap();
    }

    #[test]
    fn discovery_failure_leaves_previous_set_untouched() {
        struct FailingDiscovery;
        #[async_trait::async_trait]
        impl SentryDiscovery for FailingDiscovery {
            async fn discover(&self) -> Result<BTreeSet<SentryAddr>, DiscoveryError> {
                Err(DiscoveryError::NodeNameUnset)
            }
        }

        let rt = tokio::runtime::Runtime::new().unwrap();
        let fake = Arc::new(FakeDiscovery {
            desired: StdMutex::new(BTreeSet::from([addr("tcp://svc-a.ns:1234")])),
        });
        let watcher = Watcher::new(
            vec![],
            Arc::new(AlwaysPong),
            Some(fake.clone() as Arc<dyn SentryDiscovery>),
            rt.handle().clone(),
            1024,
        );
        watcher.reconcile_once(&(fake.clone() as Arc<dyn SentryDiscovery>));
        assert_eq!(watcher.dynamic_addresses().len(), 1);

        let failing: Arc<dyn SentryDiscovery> = Arc::new(FailingDiscovery);
        watcher.reconcile_once(&failing);
        assert_eq!(
            watcher.dynamic_addresses(),
            BTreeSet::from([addr("tcp://svc-a.ns:1234")])
        );

        watcher.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let watcher = Watcher::new(
            vec![addr("tcp://127.0.0.1:0")],
            Arc::new(AlwaysPong),
            None,
            rt.handle().clone(),
            1024,
        );
        watcher.watch();
        watcher.stop().unwrap();
        watcher.stop().unwrap();
    }
}
