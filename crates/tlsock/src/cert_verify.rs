//! Server certificate verification collaborators.
//!
//! The socket never parses or path-builds certificates itself. After the
//! handshake it hands the server chain to a [`CertVerifier`], optionally
//! short-circuited by a [`DnsCertChecker`] or merged with a verification
//! that an [`SslHostInfo`] started for a predicted chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::SystemTime;

use tlsock_types::{CertStatus, NetError};

use crate::cert::{CertificateChain, HashValue, ParsedCertificate};
use crate::runner::lock;

/// Options passed to the verifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyFlags {
    pub rev_checking: bool,
    pub ev_cert: bool,
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub cert: ParsedCertificate,
    pub host: String,
    pub flags: VerifyFlags,
}

/// Details produced by a verification, successful or not.
#[derive(Debug, Clone, Default)]
pub struct CertVerifyResult {
    pub verified_cert: Option<ParsedCertificate>,
    pub cert_status: CertStatus,
    /// SPKI hashes of the verified chain.
    pub public_key_hashes: Vec<HashValue>,
    pub is_issued_by_known_root: bool,
}

#[derive(Debug, Clone)]
pub struct Verification {
    pub result: Result<(), NetError>,
    pub details: CertVerifyResult,
}

impl Verification {
    pub fn ok(details: CertVerifyResult) -> Self {
        Self {
            result: Ok(()),
            details,
        }
    }
}

pub type VerifyHandle = u64;

pub type VerifyCallback = Box<dyn FnOnce(Verification) + Send + 'static>;

pub enum VerifyStart {
    Ready(Verification),
    Pending(VerifyHandle),
}

/// Asynchronous certificate verifier.
///
/// A `Pending` verification completes by invoking the callback once, on
/// the transport domain, unless it is cancelled first.
pub trait CertVerifier: Send + Sync {
    fn verify(&self, request: VerifyRequest, callback: VerifyCallback) -> VerifyStart;

    /// Abandons a pending verification; its callback must not run.
    fn cancel(&self, handle: VerifyHandle);
}

/// Owns at most one outstanding verification and cancels it when dropped.
pub struct SingleRequestVerifier {
    verifier: Arc<dyn CertVerifier>,
    handle: Option<VerifyHandle>,
    done: Arc<AtomicBool>,
}

impl SingleRequestVerifier {
    pub fn new(verifier: Arc<dyn CertVerifier>) -> Self {
        Self {
            verifier,
            handle: None,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// # Panics
    ///
    /// If a verification is already outstanding.
    pub fn verify(&mut self, request: VerifyRequest, callback: VerifyCallback) -> Poll<Verification> {
        assert!(self.handle.is_none(), "verification already in progress");
        self.done.store(false, Ordering::SeqCst);
        let done = Arc::clone(&self.done);
        let start = self.verifier.verify(
            request,
            Box::new(move |verification| {
                done.store(true, Ordering::SeqCst);
                callback(verification);
            }),
        );
        match start {
            VerifyStart::Ready(verification) => Poll::Ready(verification),
            VerifyStart::Pending(handle) => {
                self.handle = Some(handle);
                Poll::Pending
            }
        }
    }
}

impl Drop for SingleRequestVerifier {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !self.done.load(Ordering::SeqCst) {
                self.verifier.cancel(handle);
            }
        }
    }
}

/// DNS-based certificate authorization (DNSSEC-signed certificate records).
pub trait DnsCertChecker: Send + Sync {
    /// True when DNS vouches for `leaf` on `host:port`, in which case
    /// ordinary verification is skipped.
    fn check(&self, host: &str, port: u16, leaf: &[u8]) -> bool;
}

/// Receives stapled OCSP responses for chains it may not have seen.
pub trait OcspResponseCache: Send + Sync {
    fn cache_response(&self, leaf: &[u8], response: &[u8], now: SystemTime);
}

pub type ReadyCallback = Box<dyn FnOnce(Result<(), NetError>) + Send + 'static>;

/// Persisted knowledge about a server: the chain it sent last time, plus a
/// verification of that chain started before the handshake finished.
pub trait SslHostInfo: Send + Sync {
    /// Waits for the persisted data to load. Without a callback this only
    /// polls.
    fn wait_for_data_ready(&self, callback: Option<ReadyCallback>) -> Poll<Result<(), NetError>>;

    /// The chain seen on a previous connection, leaf first.
    fn predicted_certs(&self) -> Vec<Vec<u8>>;

    fn set_certs(&self, certs: Vec<Vec<u8>>);

    fn persist(&self);

    /// Waits for the speculative verification of the predicted chain.
    fn wait_for_cert_verification(&self, callback: VerifyCallback) -> Poll<Verification>;
}

/// [`SslHostInfo`] held in memory.
///
/// Data is ready once [`mark_ready`](Self::mark_ready) runs. With a
/// verifier attached, every chain the info holds is verified as soon as it
/// is known; without one the result is fed in with
/// [`complete_verification`](Self::complete_verification). A stored result
/// always belongs to the chain currently held.
#[derive(Default)]
pub struct MemoryHostInfo {
    inner: Arc<Mutex<HostInfoInner>>,
    verifier: Option<Speculative>,
}

struct Speculative {
    verifier: Arc<dyn CertVerifier>,
    host: String,
    flags: VerifyFlags,
}

#[derive(Default)]
struct HostInfoInner {
    ready: bool,
    certs: Vec<Vec<u8>>,
    persisted: usize,
    /// Bumped whenever `certs` changes.
    generation: u64,
    verification: Option<Verification>,
    /// Outstanding request and the generation it verifies.
    in_flight: Option<(u64, VerifyHandle)>,
    ready_waiters: Vec<ReadyCallback>,
    verify_waiters: Vec<(u64, VerifyCallback)>,
}

impl MemoryHostInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host info whose data is already loaded.
    pub fn loaded(certs: Vec<Vec<u8>>) -> Self {
        let info = Self::default();
        {
            let mut inner = lock(&info.inner);
            inner.ready = true;
            inner.certs = certs;
        }
        info
    }

    /// Verifies held chains with `verifier`, starting with the current one.
    pub fn with_verifier(
        mut self,
        verifier: Arc<dyn CertVerifier>,
        host: impl Into<String>,
        flags: VerifyFlags,
    ) -> Self {
        self.verifier = Some(Speculative {
            verifier,
            host: host.into(),
            flags,
        });
        if lock(&self.inner).ready {
            self.start_verification();
        }
        self
    }

    pub fn mark_ready(&self, certs: Vec<Vec<u8>>) {
        {
            let mut inner = lock(&self.inner);
            inner.ready = true;
            if inner.certs != certs {
                inner.certs = certs;
                inner.generation += 1;
                inner.verification = None;
            }
        }
        // Verification starts before the waiters resume their handshakes.
        self.start_verification();
        let waiters = std::mem::take(&mut lock(&self.inner).ready_waiters);
        for waiter in waiters {
            waiter(Ok(()));
        }
    }

    /// Stores the verification of the chain currently held.
    pub fn complete_verification(&self, verification: Verification) {
        let generation = lock(&self.inner).generation;
        finish_verification(&self.inner, generation, verification);
    }

    /// How many times [`SslHostInfo::persist`] ran.
    pub fn persist_count(&self) -> usize {
        lock(&self.inner).persisted
    }

    fn start_verification(&self) {
        let Some(speculative) = &self.verifier else {
            return;
        };
        let (generation, request, stale) = {
            let mut inner = lock(&self.inner);
            let current = inner.generation;
            if inner.verification.is_some() || matches!(inner.in_flight, Some((g, _)) if g == current) {
                return;
            }
            // A superseded request keeps running only while a socket waits on it.
            let stale = inner
                .in_flight
                .take()
                .filter(|(g, _)| !inner.verify_waiters.iter().any(|(w, _)| w == g))
                .map(|(_, handle)| handle);
            let request = ParsedCertificate::from_chain(&CertificateChain::new(inner.certs.clone()))
                .map(|cert| VerifyRequest {
                    cert,
                    host: speculative.host.clone(),
                    flags: speculative.flags,
                });
            (current, request, stale)
        };
        if let Some(handle) = stale {
            speculative.verifier.cancel(handle);
        }
        let Some(request) = request else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let callback: VerifyCallback = Box::new(move |verification| {
            if let Some(inner) = weak.upgrade() {
                finish_verification(&inner, generation, verification);
            }
        });
        match speculative.verifier.verify(request, callback) {
            VerifyStart::Ready(verification) => finish_verification(&self.inner, generation, verification),
            VerifyStart::Pending(handle) => {
                let mut inner = lock(&self.inner);
                if inner.generation == generation && inner.verification.is_none() {
                    inner.in_flight = Some((generation, handle));
                }
            }
        }
    }
}

impl Drop for MemoryHostInfo {
    fn drop(&mut self) {
        let in_flight = lock(&self.inner).in_flight.take();
        if let (Some(speculative), Some((_, handle))) = (&self.verifier, in_flight) {
            speculative.verifier.cancel(handle);
        }
    }
}

/// Stores the result for `generation` if it is still current and wakes
/// the sockets waiting on that chain.
fn finish_verification(inner: &Mutex<HostInfoInner>, generation: u64, verification: Verification) {
    let waiters = {
        let mut inner = lock(inner);
        if inner.generation == generation {
            inner.in_flight = None;
            inner.verification = Some(verification.clone());
        }
        let (matching, rest) = std::mem::take(&mut inner.verify_waiters)
            .into_iter()
            .partition::<Vec<_>, _>(|(g, _)| *g == generation);
        inner.verify_waiters = rest;
        matching
    };
    for (_, waiter) in waiters {
        waiter(verification.clone());
    }
}

impl SslHostInfo for MemoryHostInfo {
    fn wait_for_data_ready(&self, callback: Option<ReadyCallback>) -> Poll<Result<(), NetError>> {
        let mut inner = lock(&self.inner);
        if inner.ready {
            return Poll::Ready(Ok(()));
        }
        if let Some(callback) = callback {
            inner.ready_waiters.push(callback);
        }
        Poll::Pending
    }

    fn predicted_certs(&self) -> Vec<Vec<u8>> {
        lock(&self.inner).certs.clone()
    }

    fn set_certs(&self, certs: Vec<Vec<u8>>) {
        {
            let mut inner = lock(&self.inner);
            if inner.certs == certs {
                return;
            }
            inner.certs = certs;
            inner.generation += 1;
            inner.verification = None;
        }
        self.start_verification();
    }

    fn persist(&self) {
        lock(&self.inner).persisted += 1;
    }

    fn wait_for_cert_verification(&self, callback: VerifyCallback) -> Poll<Verification> {
        let mut inner = lock(&self.inner);
        match &inner.verification {
            Some(verification) => Poll::Ready(verification.clone()),
            None => {
                let generation = inner.generation;
                inner.verify_waiters.push((generation, callback));
                Poll::Pending
            }
        }
    }
}
