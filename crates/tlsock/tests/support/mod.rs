//! Shared fakes for the integration tests.
//!
//! The fake engine speaks a newline-delimited text protocol instead of TLS:
//!
//! ```text
//! client: CLIENT_HELLO
//! server: SERVER_HELLO <flags>
//! server: SERVER_FINISHED
//! client: CLIENT_CERT <n> | NO_CERT      (only when a certificate was requested)
//! client: FINISHED
//! both:   DATA:<payload>
//! server: HELLO_REQUEST                  (starts a renegotiation)
//! ```
//!
//! Hello flags: `resumed`, `npn=a|b`, `certreq=CA1|CA2`, `bound`,
//! `certs=leaf|inter`, `keyed=k1|k2` (X.509-shaped certificates),
//! `badcerts`, `premature`, `optional`, `staple`, `alert`, `sigfail`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};

use tlsock::cert_verify::{
    CertVerifier, CertVerifyResult, OcspResponseCache, Verification, VerifyCallback, VerifyHandle,
    VerifyRequest, VerifyStart,
};
use tlsock::client_auth::{
    BoundCert, BoundCertRequest, BoundCertService, BoundCertType, ClientCertificate,
    InMemoryCertStore, RequestHandle,
};
use tlsock::config::EngineSettings;
use tlsock::engine::{
    ChannelInfo, ClientAuthDecision, ClientAuthRequest, ClientCredential, Engine, EngineFactory,
    EngineHooks, HandshakeSummary, KeyKind, PrivateKey,
};
use tlsock::events::{EventSink, SocketEvent};
use tlsock::runner::{ManualRunner, TaskRunner};
use tlsock::transport::{SharedTransport, Transport};
use tlsock::{
    AlertDescription, CipherSuite, ClientSocketContext, CompletionCallback, ConnectionConfig, Core,
    EngineError, HostPortPair, NetError, ProtocolVersion, SslClientSocket,
};
use tlsock::bio::MemoryBio;
use tlsock::session::{session_cache_key, CachedSession, InMemorySessionCache, SessionCache};
use tlsock::socket_core::CoreParams;

pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A minimal DER SEQUENCE wrapping `name`.
pub fn der(name: &str) -> Vec<u8> {
    let mut out = vec![0x30, name.len() as u8];
    out.extend_from_slice(name.as_bytes());
    out
}

fn seq(parts: &[Vec<u8>]) -> Vec<u8> {
    let body = parts.concat();
    let mut out = vec![0x30, body.len() as u8];
    out.extend(body);
    out
}

/// An X.509-shaped certificate whose SubjectPublicKeyInfo is `der(key)`.
pub fn cert_with_key(key: &str) -> Vec<u8> {
    let tbs = seq(&[
        vec![0xa0, 0x03, 0x02, 0x01, 0x02],
        vec![0x02, 0x01, 0x07],
        der("sha256WithRSA"),
        der("issuer"),
        der("validity"),
        der("subject"),
        der(key),
    ]);
    seq(&[tbs, der("sha256WithRSA"), vec![0x03, 0x02, 0x00, 0xff]])
}

pub fn host() -> HostPortPair {
    HostPortPair::new("example.com", 443)
}

// ---------------------------------------------------------------------------
// Fake engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct HelloFlags {
    pub resumed: bool,
    pub npn: Option<Vec<Vec<u8>>>,
    pub certreq: Option<Vec<Vec<u8>>>,
    pub bound: bool,
    pub certs: Vec<Vec<u8>>,
    pub premature: bool,
    pub optional: bool,
    pub staple: bool,
    pub alert: bool,
    pub sigfail: bool,
}

impl HelloFlags {
    fn parse(text: &str) -> Self {
        let mut flags = Self::default();
        let split = |v: &str| v.split('|').filter(|s| !s.is_empty()).map(|s| s.as_bytes().to_vec()).collect();
        for token in text.split_whitespace() {
            match token.split_once('=') {
                Some(("npn", v)) => flags.npn = Some(split(v)),
                Some(("certreq", v)) => flags.certreq = Some(split(v)),
                Some(("certs", v)) => flags.certs = v.split('|').map(der).collect(),
                Some(("keyed", v)) => flags.certs = v.split('|').map(cert_with_key).collect(),
                _ => match token {
                    "resumed" => flags.resumed = true,
                    "certreq" => flags.certreq = Some(Vec::new()),
                    "bound" => flags.bound = true,
                    "badcerts" => flags.certs = vec![b"not der".to_vec()],
                    "premature" => flags.premature = true,
                    "optional" => flags.optional = true,
                    "staple" => flags.staple = true,
                    "alert" => flags.alert = true,
                    "sigfail" => flags.sigfail = true,
                    _ => {}
                },
            }
        }
        flags
    }
}

/// What the fake engines of one test did.
#[derive(Debug, Default, Clone)]
pub struct ProbeState {
    pub settings: Option<EngineSettings>,
    pub engine_threads: Vec<ThreadId>,
    pub sent_cert_count: Option<usize>,
    pub sent_no_cert: bool,
    pub suspensions: usize,
    pub restarts: usize,
    pub invalidated: usize,
    pub renegotiations: usize,
    pub completed_handshakes: usize,
}

pub struct EngineProbe {
    state: Mutex<ProbeState>,
    /// Session cache shared by every engine of one test.
    sessions: Mutex<InMemorySessionCache>,
}

impl EngineProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProbeState::default()),
            sessions: Mutex::new(InMemorySessionCache::new(16)),
        })
    }

    pub fn get(&self) -> ProbeState {
        lock(&self.state).clone()
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        lock(&self.sessions).get(peer_id).is_some()
    }

    fn with<R>(&self, f: impl FnOnce(&mut ProbeState) -> R) -> R {
        f(&mut lock(&self.state))
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Start,
    AwaitHello,
    Suspended(HelloFlags),
    Restarted(HelloFlags, Option<ClientCredential>),
    AwaitFinished(HelloFlags),
    Established,
}

pub struct FakeEngine {
    probe: Arc<EngineProbe>,
    phase: Phase,
    inbuf: Vec<u8>,
    pending: VecDeque<u8>,
    last_flags: HelloFlags,
    peer_id: String,
}

impl FakeEngine {
    pub fn new(probe: Arc<EngineProbe>) -> Self {
        Self {
            probe,
            phase: Phase::Start,
            inbuf: Vec::new(),
            pending: VecDeque::new(),
            last_flags: HelloFlags::default(),
            peer_id: String::new(),
        }
    }

    /// One line, `None` at EOF.
    fn read_line(&mut self, bio: &mut MemoryBio) -> Result<Option<String>, EngineError> {
        loop {
            if let Some(pos) = self.inbuf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.inbuf.drain(..=pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line[..pos]).into_owned()));
            }
            let mut tmp = [0u8; 512];
            match bio.engine_read(&mut tmp)? {
                0 => return Ok(None),
                n => self.inbuf.extend_from_slice(&tmp[..n]),
            }
        }
    }

    fn write_line(&mut self, bio: &mut MemoryBio, line: &str) -> Result<(), EngineError> {
        let line = format!("{line}\n");
        if bio.free_send_space() < line.len() {
            return Err(EngineError::WouldBlock);
        }
        bio.engine_write(line.as_bytes())?;
        Ok(())
    }

    fn send_cert(
        &mut self,
        bio: &mut MemoryBio,
        credential: Option<ClientCredential>,
        flags: &HelloFlags,
    ) -> Result<(), EngineError> {
        match credential {
            Some(credential) => {
                if flags.sigfail {
                    return Err(EngineError::ClientAuthSignatureFailed);
                }
                let count = credential.chain.len();
                self.probe.with(|p| p.sent_cert_count = Some(count));
                self.write_line(bio, &format!("CLIENT_CERT {count}"))
            }
            None => {
                self.probe.with(|p| p.sent_no_cert = true);
                self.write_line(bio, "NO_CERT")
            }
        }
    }

    fn summary(flags: &HelloFlags) -> HandshakeSummary {
        HandshakeSummary {
            resumed: flags.resumed,
            peer_certificates: flags.certs.clone(),
            channel: Some(ChannelInfo {
                protocol_version: 0x0303,
                cipher_suite: CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                compression_method: 0,
            }),
            peer_supports_renegotiation_info: true,
        }
    }

    fn drive(&mut self, bio: &mut MemoryBio, hooks: &mut dyn EngineHooks) -> Result<(), EngineError> {
        let current = thread::current().id();
        self.probe.with(|p| p.engine_threads.push(current));
        loop {
            match self.phase.clone() {
                Phase::Start => {
                    self.write_line(bio, "CLIENT_HELLO")?;
                    self.phase = Phase::AwaitHello;
                }
                Phase::AwaitHello => {
                    let line = self.read_line(bio)?.ok_or(EngineError::EndOfFile)?;
                    let flags = line
                        .strip_prefix("SERVER_HELLO")
                        .map(HelloFlags::parse)
                        .ok_or_else(|| EngineError::Protocol(format!("unexpected {line}")))?;
                    if flags.alert {
                        return Err(EngineError::Alert(AlertDescription::HandshakeFailure));
                    }
                    if let Some(protos) = &flags.npn {
                        let mut wire = Vec::new();
                        for p in protos {
                            wire.push(p.len() as u8);
                            wire.extend_from_slice(p);
                        }
                        hooks.select_next_protocol(&wire)?;
                    }
                    if flags.certreq.is_some() || flags.bound {
                        let request = ClientAuthRequest {
                            cert_types: if flags.bound {
                                vec![BoundCertType::EcdsaSign.code()]
                            } else {
                                vec![BoundCertType::RsaSign.code()]
                            },
                            ca_names: flags.certreq.clone().unwrap_or_default(),
                            bound_cert_negotiated: flags.bound,
                        };
                        match hooks.client_auth_requested(&request) {
                            ClientAuthDecision::Provide(c) => self.send_cert(bio, Some(c), &flags)?,
                            ClientAuthDecision::NoCertificate => self.send_cert(bio, None, &flags)?,
                            ClientAuthDecision::Suspend if flags.optional => {
                                self.send_cert(bio, None, &flags)?
                            }
                            ClientAuthDecision::Suspend => {
                                self.probe.with(|p| p.suspensions += 1);
                                self.phase = Phase::Suspended(flags);
                                return Err(EngineError::WouldBlock);
                            }
                        }
                    }
                    self.write_line(bio, "FINISHED")?;
                    self.phase = Phase::AwaitFinished(flags);
                }
                Phase::Suspended(_) => return Err(EngineError::WouldBlock),
                Phase::Restarted(flags, credential) => {
                    self.send_cert(bio, credential, &flags)?;
                    self.write_line(bio, "FINISHED")?;
                    self.phase = Phase::AwaitFinished(flags);
                }
                Phase::AwaitFinished(flags) => {
                    let line = self.read_line(bio)?.ok_or(EngineError::EndOfFile)?;
                    if line != "SERVER_FINISHED" {
                        return Err(EngineError::Protocol(format!("unexpected {line}")));
                    }
                    self.phase = Phase::Established;
                    if !flags.premature {
                        hooks.handshake_completed(&Self::summary(&flags));
                        self.probe.with(|p| p.completed_handshakes += 1);
                        self.cache_session();
                    }
                    self.last_flags = flags;
                    return Ok(());
                }
                Phase::Established => return Ok(()),
            }
        }
    }

    fn cache_session(&self) {
        let session = CachedSession {
            id: self.peer_id.as_bytes().to_vec(),
            cipher_suite: CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            protocol_version: ProtocolVersion::Tls12,
            state: b"master secret".to_vec(),
            next_proto: None,
            created_at: SystemTime::now(),
        };
        lock(&self.probe.sessions).put(&self.peer_id, session);
    }

    fn established(&self) -> bool {
        matches!(self.phase, Phase::Established)
    }
}

impl Engine for FakeEngine {
    fn configure(&mut self, settings: &EngineSettings) -> Result<(), EngineError> {
        self.probe.with(|p| p.settings = Some(settings.clone()));
        self.peer_id = settings.peer_id.clone();
        if settings.version_min > settings.version_max {
            return Err(EngineError::UnsupportedVersion);
        }
        Ok(())
    }

    fn handshake(&mut self, bio: &mut MemoryBio, hooks: &mut dyn EngineHooks) -> Result<(), EngineError> {
        self.drive(bio, hooks)
    }

    fn read(
        &mut self,
        bio: &mut MemoryBio,
        hooks: &mut dyn EngineHooks,
        buf: &mut [u8],
    ) -> Result<usize, EngineError> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if !self.established() {
                self.drive(bio, hooks)?;
            }
            match self.read_line(bio)? {
                None => return Ok(0),
                Some(line) if line == "HELLO_REQUEST" => {
                    self.probe.with(|p| p.renegotiations += 1);
                    self.phase = Phase::Start;
                }
                Some(line) => match line.strip_prefix("DATA:") {
                    Some(payload) => self.pending.extend(payload.as_bytes()),
                    None => return Err(EngineError::Protocol(format!("unexpected {line}"))),
                },
            }
        }
    }

    fn write(
        &mut self,
        bio: &mut MemoryBio,
        hooks: &mut dyn EngineHooks,
        data: &[u8],
    ) -> Result<usize, EngineError> {
        if !self.established() {
            self.drive(bio, hooks)?;
        }
        self.write_line(bio, &format!("DATA:{}", String::from_utf8_lossy(data)))?;
        Ok(data.len())
    }

    fn restart_after_cert_request(
        &mut self,
        credential: Option<ClientCredential>,
    ) -> Result<(), EngineError> {
        let Phase::Suspended(flags) = self.phase.clone() else {
            return Err(EngineError::Internal("not suspended".into()));
        };
        self.probe.with(|p| p.restarts += 1);
        self.phase = Phase::Restarted(flags, credential);
        Ok(())
    }

    fn invalidate_session(&mut self) -> Result<(), EngineError> {
        self.probe.with(|p| p.invalidated += 1);
        lock(&self.probe.sessions).remove(&self.peer_id);
        Ok(())
    }

    fn stapled_ocsp_response(&self) -> Option<Vec<u8>> {
        self.last_flags.staple.then(|| b"ocsp".to_vec())
    }

    fn export_keying_material(
        &mut self,
        label: &str,
        _context: Option<&[u8]>,
        out_len: usize,
    ) -> Result<Vec<u8>, EngineError> {
        if !self.established() {
            return Err(EngineError::Internal("handshake not complete".into()));
        }
        Ok(vec![label.len() as u8; out_len])
    }
}

pub fn engine_factory(probe: &Arc<EngineProbe>) -> Arc<dyn EngineFactory> {
    let probe = Arc::clone(probe);
    Arc::new(move || -> Result<Box<dyn Engine>, NetError> {
        Ok(Box::new(FakeEngine::new(Arc::clone(&probe))))
    })
}

// ---------------------------------------------------------------------------
// Fake wire and transport
// ---------------------------------------------------------------------------

/// How the fake transport completes operations it can finish right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Sync,
    Async,
}

/// The scripted server behind the fake transport.
#[derive(Debug, Clone, Default)]
pub struct ServerScript {
    /// Flags for the first SERVER_HELLO.
    pub hello: String,
    /// Flags for later SERVER_HELLOs (renegotiations).
    pub reneg_hello: String,
    /// Sent right after a renegotiation completes.
    pub after_reneg: Option<String>,
    /// Echo DATA lines back.
    pub echo: bool,
}

impl ServerScript {
    pub fn hello(flags: &str) -> Self {
        Self {
            hello: flags.into(),
            ..Default::default()
        }
    }
}

struct WireState {
    script: ServerScript,
    incoming: VecDeque<u8>,
    eof: bool,
    read_error: Option<NetError>,
    parked_read: Option<(usize, CompletionCallback<Vec<u8>>)>,
    partial: Vec<u8>,
    client_lines: Vec<String>,
    hellos: usize,
    reads_issued: usize,
    writes_issued: usize,
    connected: bool,
}

impl WireState {
    fn push(&mut self, line: &str) {
        self.incoming.extend(line.as_bytes());
        self.incoming.push_back(b'\n');
    }

    fn feed(&mut self, data: &[u8]) {
        self.partial.extend_from_slice(data);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).into_owned();
            if self.eof {
                // The server has hung up.
            } else if line == "CLIENT_HELLO" {
                let flags = if self.hellos == 0 {
                    self.script.hello.clone()
                } else {
                    self.script.reneg_hello.clone()
                };
                self.hellos += 1;
                self.push(&format!("SERVER_HELLO {flags}"));
                self.push("SERVER_FINISHED");
                if self.hellos > 1 {
                    if let Some(data) = self.script.after_reneg.clone() {
                        self.push(&format!("DATA:{data}"));
                    }
                }
            } else if line.starts_with("DATA:") && self.script.echo {
                let echo = line.clone();
                self.push(&echo);
            }
            self.client_lines.push(line);
        }
    }

    fn take_read(&mut self, len: usize) -> Option<Result<Vec<u8>, NetError>> {
        if let Some(e) = self.read_error.clone() {
            return Some(Err(e));
        }
        if !self.incoming.is_empty() {
            let n = len.min(self.incoming.len());
            return Some(Ok(self.incoming.drain(..n).collect()));
        }
        self.eof.then(|| Ok(Vec::new()))
    }
}

/// Test-side handle on the fake transport's peer.
#[derive(Clone)]
pub struct FakeWire {
    state: Arc<Mutex<WireState>>,
    runner: Arc<dyn TaskRunner>,
    mode: IoMode,
}

impl FakeWire {
    pub fn new(script: ServerScript, mode: IoMode, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            state: Arc::new(Mutex::new(WireState {
                script,
                incoming: VecDeque::new(),
                eof: false,
                read_error: None,
                parked_read: None,
                partial: Vec::new(),
                client_lines: Vec::new(),
                hellos: 0,
                reads_issued: 0,
                writes_issued: 0,
                connected: true,
            })),
            runner,
            mode,
        }
    }

    pub fn transport(&self) -> SharedTransport {
        Arc::new(Mutex::new(FakeTransport { wire: self.clone() }))
    }

    pub fn push_line(&self, line: &str) {
        lock(&self.state).push(line);
        self.deliver_parked();
    }

    /// The server closes its end.
    pub fn close(&self) {
        lock(&self.state).eof = true;
        self.deliver_parked();
    }

    pub fn fail_reads(&self, error: NetError) {
        lock(&self.state).read_error = Some(error);
        self.deliver_parked();
    }

    pub fn reads_issued(&self) -> usize {
        lock(&self.state).reads_issued
    }

    pub fn writes_issued(&self) -> usize {
        lock(&self.state).writes_issued
    }

    pub fn client_lines(&self) -> Vec<String> {
        lock(&self.state).client_lines.clone()
    }

    pub fn has_parked_read(&self) -> bool {
        lock(&self.state).parked_read.is_some()
    }

    fn deliver_parked(&self) {
        let ready = {
            let mut st = lock(&self.state);
            match st.parked_read.take() {
                Some((len, callback)) => match st.take_read(len) {
                    Some(result) => Some((callback, result)),
                    None => {
                        st.parked_read = Some((len, callback));
                        None
                    }
                },
                None => None,
            }
        };
        if let Some((callback, result)) = ready {
            self.runner.post_task(Box::new(move || callback(result)));
        }
    }
}

pub struct FakeTransport {
    wire: FakeWire,
}

impl Transport for FakeTransport {
    fn read(&mut self, len: usize, callback: CompletionCallback<Vec<u8>>) -> Poll<Result<Vec<u8>, NetError>> {
        let mut st = lock(&self.wire.state);
        st.reads_issued += 1;
        match st.take_read(len) {
            Some(result) if self.wire.mode == IoMode::Sync => Poll::Ready(result),
            Some(result) => {
                drop(st);
                self.wire.runner.post_task(Box::new(move || callback(result)));
                Poll::Pending
            }
            None => {
                st.parked_read = Some((len, callback));
                Poll::Pending
            }
        }
    }

    fn write(&mut self, data: Vec<u8>, callback: CompletionCallback<usize>) -> Poll<Result<usize, NetError>> {
        let n = data.len();
        {
            let mut st = lock(&self.wire.state);
            st.writes_issued += 1;
            st.feed(&data);
        }
        self.wire.deliver_parked();
        match self.wire.mode {
            IoMode::Sync => Poll::Ready(Ok(n)),
            IoMode::Async => {
                self.wire.runner.post_task(Box::new(move || callback(Ok(n))));
                Poll::Pending
            }
        }
    }

    fn disconnect(&mut self) {
        lock(&self.wire.state).connected = false;
    }

    fn is_connected(&self) -> bool {
        lock(&self.wire.state).connected
    }

    fn is_connected_and_idle(&self) -> bool {
        let st = lock(&self.wire.state);
        st.connected && st.incoming.is_empty()
    }

    fn peer_address(&self) -> Result<SocketAddr, NetError> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 443)))
    }
}

// ---------------------------------------------------------------------------
// Fake collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Sync,
    /// Completes by posting to the runner.
    Async,
    /// Completes when the test calls `complete_all`.
    Manual,
}

pub struct FakeVerifier {
    mode: VerifyMode,
    runner: Arc<dyn TaskRunner>,
    outcome: Mutex<(Result<(), NetError>, CertVerifyResult)>,
    parked: Mutex<Vec<(VerifyHandle, VerifyCallback, Verification)>>,
    next_handle: AtomicUsize,
    pub calls: AtomicUsize,
    pub cancelled: AtomicUsize,
}

impl FakeVerifier {
    pub fn new(mode: VerifyMode, runner: Arc<dyn TaskRunner>) -> Arc<Self> {
        Arc::new(Self {
            mode,
            runner,
            outcome: Mutex::new((Ok(()), CertVerifyResult::default())),
            parked: Mutex::new(Vec::new()),
            next_handle: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        })
    }

    pub fn set_outcome(&self, result: Result<(), NetError>, details: CertVerifyResult) {
        *lock(&self.outcome) = (result, details);
    }

    pub fn complete_all(&self) {
        let parked = std::mem::take(&mut *lock(&self.parked));
        for (_, callback, verification) in parked {
            callback(verification);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl CertVerifier for FakeVerifier {
    fn verify(&self, request: VerifyRequest, callback: VerifyCallback) -> VerifyStart {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (result, mut details) = lock(&self.outcome).clone();
        if details.verified_cert.is_none() {
            details.verified_cert = Some(request.cert);
        }
        let verification = Verification { result, details };
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) as VerifyHandle;
        match self.mode {
            VerifyMode::Sync => VerifyStart::Ready(verification),
            VerifyMode::Async => {
                self.runner.post_task(Box::new(move || callback(verification)));
                VerifyStart::Pending(handle)
            }
            VerifyMode::Manual => {
                lock(&self.parked).push((handle, callback, verification));
                VerifyStart::Pending(handle)
            }
        }
    }

    fn cancel(&self, handle: VerifyHandle) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        lock(&self.parked).retain(|(h, _, _)| *h != handle);
    }
}

pub fn bound_cert() -> BoundCert {
    BoundCert {
        cert_type: BoundCertType::EcdsaSign,
        cert: der("bound"),
        private_key: PrivateKey::new(KeyKind::EncryptedPkcs8, vec![7; 16]),
    }
}

pub struct FakeBoundCertService {
    /// Answer synchronously with this result instead of parking.
    sync_result: Option<Result<BoundCert, NetError>>,
    runner: Arc<dyn TaskRunner>,
    parked: Mutex<Option<(RequestHandle, CompletionCallback<BoundCert>)>>,
    pub requests: Mutex<Vec<(String, Vec<u8>)>>,
    pub cancelled: AtomicUsize,
}

impl FakeBoundCertService {
    pub fn sync(result: Result<BoundCert, NetError>, runner: Arc<dyn TaskRunner>) -> Arc<Self> {
        Arc::new(Self {
            sync_result: Some(result),
            runner,
            parked: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        })
    }

    pub fn parking(runner: Arc<dyn TaskRunner>) -> Arc<Self> {
        Arc::new(Self {
            sync_result: None,
            runner,
            parked: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        })
    }

    pub fn is_parked(&self) -> bool {
        lock(&self.parked).is_some()
    }

    /// Completes the parked request on the runner.
    pub fn complete(&self, result: Result<BoundCert, NetError>) {
        if let Some((_, callback)) = lock(&self.parked).take() {
            self.runner.post_task(Box::new(move || callback(result)));
        }
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl BoundCertService for FakeBoundCertService {
    fn get_bound_cert(
        &self,
        origin: &str,
        requested_types: &[u8],
        callback: CompletionCallback<BoundCert>,
    ) -> BoundCertRequest {
        lock(&self.requests).push((origin.to_string(), requested_types.to_vec()));
        match &self.sync_result {
            Some(result) => BoundCertRequest::Ready(result.clone()),
            None => {
                *lock(&self.parked) = Some((42, callback));
                BoundCertRequest::Pending(42)
            }
        }
    }

    fn cancel_request(&self, handle: RequestHandle) {
        if lock(&self.parked).take().is_some_and(|(h, _)| h == handle) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
pub struct RecordingOcspCache {
    pub responses: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl OcspResponseCache for RecordingOcspCache {
    fn cache_response(&self, leaf: &[u8], response: &[u8], _now: SystemTime) {
        lock(&self.responses).push((leaf.to_vec(), response.to_vec()));
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SocketEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SocketEvent> {
        lock(&self.events).clone()
    }

    pub fn contains(&self, event: &SocketEvent) -> bool {
        lock(&self.events).contains(event)
    }
}

impl EventSink for RecordingSink {
    fn add_event(&self, event: &SocketEvent) {
        lock(&self.events).push(event.clone());
    }
}

pub fn client_cert(name: &str, issuer: &str, valid: bool) -> ClientCertificate {
    let now = SystemTime::now();
    let hour = Duration::from_secs(3600);
    let (not_before, not_after) = if valid {
        (now - hour, now + hour)
    } else {
        (now - 2 * hour, now - hour)
    };
    ClientCertificate {
        der: der(name),
        intermediates: Vec::new(),
        issuers: vec![issuer.as_bytes().to_vec()],
        not_before,
        not_after,
    }
}

// ---------------------------------------------------------------------------
// Completion capture
// ---------------------------------------------------------------------------

/// Records what a completion callback was called with.
pub struct Captured<T> {
    result: Arc<Mutex<Option<Result<T, NetError>>>>,
    calls: Arc<AtomicUsize>,
}

impl<T> Clone for Captured<T> {
    fn clone(&self) -> Self {
        Self {
            result: Arc::clone(&self.result),
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<T: Send + 'static> Captured<T> {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn take(&self) -> Option<Result<T, NetError>> {
        lock(&self.result).take()
    }
}

pub fn capture<T: Send + 'static>() -> (CompletionCallback<T>, Captured<T>) {
    let captured = Captured {
        result: Arc::new(Mutex::new(None)),
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let c = captured.clone();
    let callback: CompletionCallback<T> = Box::new(move |result| {
        c.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&c.result) = Some(result);
    });
    (callback, captured)
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Everything on one [`ManualRunner`] owned by the test thread, so both
/// domains run inline and posted work runs on `run()`.
pub struct Harness {
    pub runner: Arc<ManualRunner>,
    pub wire: FakeWire,
    pub transport: SharedTransport,
    pub probe: Arc<EngineProbe>,
    pub verifier: Arc<FakeVerifier>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<InMemoryCertStore>,
}

impl Harness {
    pub fn new(script: ServerScript, mode: IoMode) -> Self {
        Self::with_verify_mode(script, mode, VerifyMode::Sync)
    }

    pub fn with_verify_mode(script: ServerScript, mode: IoMode, verify_mode: VerifyMode) -> Self {
        let runner = ManualRunner::new();
        let dyn_runner: Arc<dyn TaskRunner> = runner.clone();
        let wire = FakeWire::new(script, mode, Arc::clone(&dyn_runner));
        let transport = wire.transport();
        Self {
            verifier: FakeVerifier::new(verify_mode, dyn_runner),
            runner,
            wire,
            transport,
            probe: EngineProbe::new(),
            sink: Arc::new(RecordingSink::default()),
            store: Arc::new(InMemoryCertStore::new()),
        }
    }

    pub fn dyn_runner(&self) -> Arc<dyn TaskRunner> {
        self.runner.clone()
    }

    pub fn run(&self) -> usize {
        self.runner.run_until_idle()
    }

    pub fn core_params(&self, config: ConnectionConfig) -> CoreParams {
        CoreParams {
            host_and_port: host(),
            config: Arc::new(config),
            network_runner: self.dyn_runner(),
            engine_runner: self.dyn_runner(),
            transport: Arc::clone(&self.transport),
            cert_store: self.store.clone(),
            bound_cert_service: None,
            ocsp_cache: None,
            event_sink: self.sink.clone(),
        }
    }

    /// A Core with its engine installed.
    pub fn core_from(&self, params: CoreParams) -> Arc<Core> {
        let config = Arc::clone(&params.config);
        let core = Core::new(params);
        self.install_engine(&core, &config);
        core
    }

    /// Hands `core` a fresh fake engine for its next connect.
    pub fn install_engine(&self, core: &Core, config: &ConnectionConfig) {
        let settings = EngineSettings::new(config, &host(), session_cache_key(&host(), ""), None);
        core.init(Box::new(FakeEngine::new(Arc::clone(&self.probe))), settings);
    }

    pub fn core(&self, config: ConnectionConfig) -> Arc<Core> {
        self.core_from(self.core_params(config))
    }

    pub fn context(&self) -> ClientSocketContext {
        ClientSocketContext::new(
            self.dyn_runner(),
            self.dyn_runner(),
            engine_factory(&self.probe),
            self.verifier.clone(),
        )
        .with_cert_store(self.store.clone())
        .with_event_sink(self.sink.clone())
    }

    pub fn socket(&self, config: ConnectionConfig) -> SslClientSocket {
        self.socket_with(config, self.context())
    }

    pub fn socket_with(&self, config: ConnectionConfig, context: ClientSocketContext) -> SslClientSocket {
        SslClientSocket::new(Arc::clone(&self.transport), host(), config, context)
    }
}

/// Drains `runner` until `done` holds or five seconds pass.
pub fn run_until(runner: &ManualRunner, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        runner.run_until_idle();
        if done() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Resolves an operation that may have completed inline.
pub fn settle<T: Send + 'static>(
    runner: &ManualRunner,
    rv: Poll<Result<T, NetError>>,
    captured: &Captured<T>,
) -> Result<T, NetError> {
    match rv {
        Poll::Ready(result) => result,
        Poll::Pending => {
            assert!(run_until(runner, || captured.calls() > 0), "operation never completed");
            captured.take().expect("callback result")
        }
    }
}
