//! The client socket facade.
//!
//! [`SslClientSocket`] owns a [`Core`] for the TLS handshake and drives the
//! steps around it: loading cached host info, then verifying the server
//! certificate once the handshake finishes. Every method runs on the
//! transport domain.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::task::Poll;
use std::time::SystemTime;

use tlsock_types::{CertStatus, NetError};

use crate::cert::{HashValue, ParsedCertificate};
use crate::cert_verify::{
    CertVerifier, CertVerifyResult, DnsCertChecker, OcspResponseCache, SingleRequestVerifier,
    SslHostInfo, Verification, VerifyFlags, VerifyRequest,
};
use crate::client_auth::{BoundCertService, ClientCertStore, InMemoryCertStore};
use crate::config::{ConnectionConfig, EngineSettings};
use crate::connection_info::{CertRequestInfo, ConnectionInfo, HandshakeType, NegotiatedProtocol};
use crate::engine::EngineFactory;
use crate::events::{EventSink, LogEventSink, SocketEvent};
use crate::export::validate_exporter_label;
use crate::pins::{check_pins, PinPolicy, TransportSecurityState};
use crate::runner::{lock, TaskRunner};
use crate::session::session_cache_key;
use crate::socket_core::{Core, CoreParams};
use crate::transport::SharedTransport;
use crate::{CompletionCallback, HostPortPair};

/// Largest certificate that can be saved to host info.
const MAX_SAVED_CERT_LEN: usize = u16::MAX as usize;

/// Collaborators shared by the sockets of one embedder.
#[derive(Clone)]
pub struct ClientSocketContext {
    pub network_runner: Arc<dyn TaskRunner>,
    pub engine_runner: Arc<dyn TaskRunner>,
    pub engine_factory: Arc<dyn EngineFactory>,
    pub cert_verifier: Arc<dyn CertVerifier>,
    pub cert_store: Arc<dyn ClientCertStore>,
    pub bound_cert_service: Option<Arc<dyn BoundCertService>>,
    pub transport_security_state: Option<Arc<dyn TransportSecurityState>>,
    pub dns_cert_checker: Option<Arc<dyn DnsCertChecker>>,
    pub ocsp_cache: Option<Arc<dyn OcspResponseCache>>,
    pub ssl_host_info: Option<Arc<dyn SslHostInfo>>,
    /// Partitions session reuse; empty for none.
    pub session_cache_shard: String,
    pub event_sink: Arc<dyn EventSink>,
    pub pin_policy: PinPolicy,
}

impl ClientSocketContext {
    pub fn new(
        network_runner: Arc<dyn TaskRunner>,
        engine_runner: Arc<dyn TaskRunner>,
        engine_factory: Arc<dyn EngineFactory>,
        cert_verifier: Arc<dyn CertVerifier>,
    ) -> Self {
        Self {
            network_runner,
            engine_runner,
            engine_factory,
            cert_verifier,
            cert_store: Arc::new(InMemoryCertStore::new()),
            bound_cert_service: None,
            transport_security_state: None,
            dns_cert_checker: None,
            ocsp_cache: None,
            ssl_host_info: None,
            session_cache_shard: String::new(),
            event_sink: Arc::new(LogEventSink),
            pin_policy: PinPolicy::default(),
        }
    }

    pub fn with_cert_store(mut self, store: Arc<dyn ClientCertStore>) -> Self {
        self.cert_store = store;
        self
    }

    pub fn with_bound_cert_service(mut self, service: Arc<dyn BoundCertService>) -> Self {
        self.bound_cert_service = Some(service);
        self
    }

    pub fn with_transport_security_state(mut self, state: Arc<dyn TransportSecurityState>) -> Self {
        self.transport_security_state = Some(state);
        self
    }

    pub fn with_dns_cert_checker(mut self, checker: Arc<dyn DnsCertChecker>) -> Self {
        self.dns_cert_checker = Some(checker);
        self
    }

    pub fn with_ocsp_cache(mut self, cache: Arc<dyn OcspResponseCache>) -> Self {
        self.ocsp_cache = Some(cache);
        self
    }

    pub fn with_ssl_host_info(mut self, info: Arc<dyn SslHostInfo>) -> Self {
        self.ssl_host_info = Some(info);
        self
    }

    pub fn with_session_cache_shard(mut self, shard: impl Into<String>) -> Self {
        self.session_cache_shard = shard.into();
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_pin_policy(mut self, policy: PinPolicy) -> Self {
        self.pin_policy = policy;
        self
    }
}

impl fmt::Debug for ClientSocketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocketContext")
            .field("bound_cert_service", &self.bound_cert_service.is_some())
            .field("transport_security_state", &self.transport_security_state.is_some())
            .field("dns_cert_checker", &self.dns_cert_checker.is_some())
            .field("ocsp_cache", &self.ocsp_cache.is_some())
            .field("ssl_host_info", &self.ssl_host_info.is_some())
            .field("session_cache_shard", &self.session_cache_shard)
            .field("pin_policy", &self.pin_policy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    None,
    LoadHostInfo,
    Handshake,
    HandshakeComplete,
    VerifyDns,
    VerifyCert,
    VerifyCertComplete,
}

struct SocketState {
    core: Arc<Core>,
    next_state: ConnectState,
    connect_callback: Option<CompletionCallback<()>>,
    verifier: Option<SingleRequestVerifier>,
    verify_result: Option<CertVerifyResult>,
    completed_handshake: bool,
    pin_override_active: bool,
    /// Bumped per connect attempt and by `disconnect`; completions from
    /// older attempts are ignored.
    generation: u64,
}

struct Inner {
    host_and_port: HostPortPair,
    config: Arc<ConnectionConfig>,
    context: ClientSocketContext,
    transport: SharedTransport,
    state: Mutex<SocketState>,
}

/// A TLS client socket over a [`Transport`](crate::transport::Transport).
pub struct SslClientSocket {
    inner: Arc<Inner>,
}

impl SslClientSocket {
    pub fn new(
        transport: SharedTransport,
        host_and_port: HostPortPair,
        config: ConnectionConfig,
        context: ClientSocketContext,
    ) -> Self {
        let config = Arc::new(config);
        let core = new_core(&host_and_port, &config, &context, &transport);
        Self {
            inner: Arc::new(Inner {
                host_and_port,
                config,
                context,
                transport,
                state: Mutex::new(SocketState {
                    core,
                    next_state: ConnectState::None,
                    connect_callback: None,
                    verifier: None,
                    verify_result: None,
                    completed_handshake: false,
                    pin_override_active: false,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn host_and_port(&self) -> &HostPortPair {
        &self.inner.host_and_port
    }

    /// Handshakes and verifies the server certificate.
    ///
    /// # Panics
    ///
    /// If a connect is already in progress.
    pub fn connect(&self, callback: CompletionCallback<()>) -> Poll<Result<(), NetError>> {
        let inner = &self.inner;
        let mut st = lock(&inner.state);
        assert!(
            st.next_state == ConnectState::None && st.connect_callback.is_none(),
            "connect while a connect is pending"
        );
        inner.add_event(SocketEvent::ConnectBegin);

        reset_attempt(&mut st);
        if let Err(e) = inner.init_core(&st.core) {
            inner.add_event(SocketEvent::ConnectEnd {
                result: Err(e.clone()),
            });
            return Poll::Ready(Err(e));
        }

        st.next_state = if inner.config.cached_info && inner.context.ssl_host_info.is_some() {
            ConnectState::LoadHostInfo
        } else {
            ConnectState::Handshake
        };

        let rv = inner.do_handshake_loop(&mut st, Ok(()));
        match &rv {
            Poll::Pending => st.connect_callback = Some(callback),
            Poll::Ready(result) => inner.add_event(SocketEvent::ConnectEnd {
                result: result.clone(),
            }),
        }
        rv
    }

    /// Reads application data into `buf`, returned truncated to the bytes
    /// read. An empty result is EOF.
    pub fn read(&self, buf: Vec<u8>, callback: CompletionCallback<Vec<u8>>) -> Poll<Result<Vec<u8>, NetError>> {
        match self.connected_core() {
            Some(core) => core.read(buf, callback),
            None => Poll::Ready(Err(NetError::SocketNotConnected)),
        }
    }

    pub fn write(&self, data: Vec<u8>, callback: CompletionCallback<usize>) -> Poll<Result<usize, NetError>> {
        match self.connected_core() {
            Some(core) => core.write(data, callback),
            None => Poll::Ready(Err(NetError::SocketNotConnected)),
        }
    }

    fn connected_core(&self) -> Option<Arc<Core>> {
        let st = lock(&self.inner.state);
        st.completed_handshake.then(|| Arc::clone(&st.core))
    }

    /// Tears the connection down. Pending callbacks never fire and the
    /// socket can connect again afterwards.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let (old_core, verifier) = {
            let mut st = lock(&inner.state);
            let fresh = new_core(&inner.host_and_port, &inner.config, &inner.context, &inner.transport);
            let old_core = std::mem::replace(&mut st.core, fresh);
            let verifier = st.verifier.take();
            st.next_state = ConnectState::None;
            st.connect_callback = None;
            reset_attempt(&mut st);
            (old_core, verifier)
        };
        old_core.detach();
        drop(verifier);
        lock(&inner.transport).disconnect();
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).completed_handshake && lock(&self.inner.transport).is_connected()
    }

    pub fn is_connected_and_idle(&self) -> bool {
        lock(&self.inner.state).completed_handshake
            && lock(&self.inner.transport).is_connected_and_idle()
    }

    pub fn peer_address(&self) -> Result<SocketAddr, NetError> {
        lock(&self.inner.transport).peer_address()
    }

    /// Negotiated parameters. Empty until the server sent certificates.
    pub fn get_connection_info(&self) -> ConnectionInfo {
        let st = lock(&self.inner.state);
        let hs = st.core.state();
        let mut info = ConnectionInfo::default();
        if hs.server_cert_chain.is_empty() {
            return info;
        }
        if let Some(verified) = &st.verify_result {
            info.cert = verified.verified_cert.clone();
            info.cert_status = verified.cert_status;
            info.public_key_hashes = verified.public_key_hashes.clone();
            info.is_issued_by_known_root = verified.is_issued_by_known_root;
        }
        let status = hs.connection_status;
        info.connection_status = status;
        info.cipher_suite = status.cipher_suite();
        info.protocol_version = status.protocol_version();
        info.compression = status.compression();
        info.pin_override_active = st.pin_override_active;
        info.bound_cert_type = hs.client_cert_type;
        info.client_cert_sent = hs.client_cert_type.is_some()
            || (self.inner.config.send_client_cert && self.inner.config.client_cert.is_some());
        info.handshake_type = if hs.resumed {
            HandshakeType::Resumed
        } else {
            HandshakeType::Full
        };
        info
    }

    pub fn get_negotiated_protocol(&self) -> NegotiatedProtocol {
        let hs = lock(&self.inner.state).core.state();
        NegotiatedProtocol {
            status: hs.next_proto_status,
            protocol: hs.next_proto.clone(),
            server_protos: hs.server_protos.clone(),
        }
    }

    /// Client certificates matching the server's last certificate request.
    pub fn get_client_cert_request_info(&self) -> CertRequestInfo {
        let hs = lock(&self.inner.state).core.state();
        CertRequestInfo {
            host_and_port: self.inner.host_and_port.to_string(),
            client_certs: hs.client_certs.clone(),
        }
    }

    /// Exports keying material (RFC 5705). Blocks while the engine domain
    /// is busy with a handshake.
    pub fn export_keying_material(
        &self,
        label: &str,
        context: Option<&[u8]>,
        out_len: usize,
    ) -> Result<Vec<u8>, NetError> {
        if !self.is_connected() {
            return Err(NetError::SocketNotConnected);
        }
        validate_exporter_label(label)?;
        let core = Arc::clone(&lock(&self.inner.state).core);
        core.export_keying_material(label, context, out_len)
    }
}

impl Drop for SslClientSocket {
    fn drop(&mut self) {
        let (core, verifier) = {
            let mut st = lock(&self.inner.state);
            st.connect_callback = None;
            (Arc::clone(&st.core), st.verifier.take())
        };
        core.detach();
        drop(verifier);
    }
}

impl fmt::Debug for SslClientSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslClientSocket")
            .field("host_and_port", &self.inner.host_and_port)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn new_core(
    host_and_port: &HostPortPair,
    config: &Arc<ConnectionConfig>,
    context: &ClientSocketContext,
    transport: &SharedTransport,
) -> Arc<Core> {
    Core::new(CoreParams {
        host_and_port: host_and_port.clone(),
        config: Arc::clone(config),
        network_runner: Arc::clone(&context.network_runner),
        engine_runner: Arc::clone(&context.engine_runner),
        transport: Arc::clone(transport),
        cert_store: Arc::clone(&context.cert_store),
        bound_cert_service: context.bound_cert_service.clone(),
        ocsp_cache: context.ocsp_cache.clone(),
        event_sink: Arc::clone(&context.event_sink),
    })
}

/// Forgets what the previous connect attempt learned.
fn reset_attempt(st: &mut SocketState) {
    st.verify_result = None;
    st.completed_handshake = false;
    st.pin_override_active = false;
    st.generation += 1;
}

fn spki_hashes(cert: Option<&ParsedCertificate>) -> Vec<HashValue> {
    cert.map(ParsedCertificate::public_key_hashes).unwrap_or_default()
}

impl Inner {
    fn add_event(&self, event: SocketEvent) {
        self.context.event_sink.add_event(&event);
    }


    /// Creates the engine and hands it to the Core with its settings.
    fn init_core(&self, core: &Core) -> Result<(), NetError> {
        let engine = self.context.engine_factory.create()?;
        let peer_address = match lock(&self.transport).peer_address() {
            Ok(addr) => Some(addr),
            Err(e) => {
                log::debug!("no peer address for {}: {e}", self.host_and_port);
                None
            }
        };
        let peer_id = session_cache_key(&self.host_and_port, &self.context.session_cache_shard);
        let settings = EngineSettings::new(&self.config, &self.host_and_port, peer_id, peer_address);
        core.init(engine, settings);
        Ok(())
    }

    /// Continues the connect after an asynchronous step finished.
    fn resume(
        self: &Arc<Self>,
        generation: u64,
        result: Result<(), NetError>,
        prepare: impl FnOnce(&mut SocketState),
    ) {
        let (callback, result) = {
            let mut st = lock(&self.state);
            if st.generation != generation {
                return;
            }
            prepare(&mut *st);
            match self.do_handshake_loop(&mut st, result) {
                Poll::Pending => return,
                Poll::Ready(result) => (st.connect_callback.take(), result),
            }
        };
        self.add_event(SocketEvent::ConnectEnd {
            result: result.clone(),
        });
        if let Some(callback) = callback {
            callback(result);
        }
    }

    fn io_callback(self: &Arc<Self>, generation: u64) -> CompletionCallback<()> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        Box::new(move |result| {
            if let Some(inner) = weak.upgrade() {
                inner.resume(generation, result, |_| {});
            }
        })
    }

    fn verify_callback(self: &Arc<Self>, generation: u64) -> Box<dyn FnOnce(Verification) + Send> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        Box::new(move |verification: Verification| {
            if let Some(inner) = weak.upgrade() {
                let Verification { result, details } = verification;
                inner.resume(generation, result, move |st| st.verify_result = Some(details));
            }
        })
    }

    fn do_handshake_loop(
        self: &Arc<Self>,
        st: &mut SocketState,
        last_io_result: Result<(), NetError>,
    ) -> Poll<Result<(), NetError>> {
        let mut rv = Poll::Ready(last_io_result);
        loop {
            let state = st.next_state;
            st.next_state = ConnectState::None;
            let input = match rv {
                Poll::Ready(result) => result,
                Poll::Pending => Ok(()),
            };
            rv = match state {
                ConnectState::LoadHostInfo => self.do_load_host_info(st),
                ConnectState::Handshake => self.do_handshake(st),
                ConnectState::HandshakeComplete => self.do_handshake_complete(st, input),
                ConnectState::VerifyDns => self.do_verify_dns(st),
                ConnectState::VerifyCert => self.do_verify_cert(st),
                ConnectState::VerifyCertComplete => self.do_verify_cert_complete(st, input),
                ConnectState::None => {
                    log::error!("unexpected connect state");
                    Poll::Ready(Err(NetError::Unexpected("connect loop without a state".into())))
                }
            };
            if rv.is_pending() || st.next_state == ConnectState::None {
                return rv;
            }
        }
    }

    fn do_load_host_info(self: &Arc<Self>, st: &mut SocketState) -> Poll<Result<(), NetError>> {
        st.next_state = ConnectState::Handshake;
        let Some(info) = &self.context.ssl_host_info else {
            return Poll::Ready(Ok(()));
        };
        match info.wait_for_data_ready(Some(self.io_callback(st.generation))) {
            Poll::Pending => {
                st.next_state = ConnectState::LoadHostInfo;
                Poll::Pending
            }
            Poll::Ready(Err(e)) => {
                log::debug!("host info for {} unavailable: {e}", self.host_and_port);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(())) => {
                let certs = info.predicted_certs();
                if !certs.is_empty() {
                    st.core.set_predicted_certificates(certs);
                }
                Poll::Ready(Ok(()))
            }
        }
    }

    fn do_handshake(self: &Arc<Self>, st: &mut SocketState) -> Poll<Result<(), NetError>> {
        let rv = st.core.connect(self.io_callback(st.generation));
        st.next_state = ConnectState::HandshakeComplete;
        rv
    }

    fn do_handshake_complete(
        &self,
        st: &mut SocketState,
        result: Result<(), NetError>,
    ) -> Poll<Result<(), NetError>> {
        if result.is_ok() {
            self.save_host_info(&st.core);
            st.next_state = ConnectState::VerifyDns;
        }
        Poll::Ready(result)
    }

    fn do_verify_dns(&self, st: &mut SocketState) -> Poll<Result<(), NetError>> {
        let hs = st.core.state();
        if let (Some(checker), Some(leaf)) = (&self.context.dns_cert_checker, hs.server_cert_chain.leaf()) {
            if checker.check(&self.host_and_port.host, self.host_and_port.port, leaf) {
                let mut details = CertVerifyResult {
                    verified_cert: hs.server_cert.clone(),
                    public_key_hashes: spki_hashes(hs.server_cert.as_ref()),
                    ..Default::default()
                };
                details.cert_status.insert(CertStatus::IS_DNSSEC);
                st.verify_result = Some(details);
                st.next_state = ConnectState::VerifyCertComplete;
                return Poll::Ready(Ok(()));
            }
        }
        st.next_state = ConnectState::VerifyCert;
        Poll::Ready(Ok(()))
    }

    fn do_verify_cert(self: &Arc<Self>, st: &mut SocketState) -> Poll<Result<(), NetError>> {
        st.next_state = ConnectState::VerifyCertComplete;
        let hs = st.core.state();

        if let Some(status) = hs
            .server_cert_chain
            .leaf()
            .and_then(|leaf| self.config.allowed_bad_cert_status(leaf))
        {
            log::debug!("received an expected bad certificate with status {status:?}");
            st.verify_result = Some(CertVerifyResult {
                verified_cert: hs.server_cert.clone(),
                cert_status: status,
                public_key_hashes: spki_hashes(hs.server_cert.as_ref()),
                ..Default::default()
            });
            return Poll::Ready(Ok(()));
        }

        let Some(server_cert) = hs.server_cert.clone() else {
            st.verify_result = Some(CertVerifyResult {
                cert_status: CertStatus(CertStatus::INVALID),
                ..Default::default()
            });
            return Poll::Ready(Err(NetError::CertificateInvalid));
        };

        if let Some(info) = &self.context.ssl_host_info {
            if hs.predicted_chain_matched && !info.predicted_certs().is_empty() {
                // A verification of this exact chain is already running.
                self.add_event(SocketEvent::VerificationMerged);
                return match info.wait_for_cert_verification(self.verify_callback(st.generation)) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(verification) => {
                        st.verify_result = Some(verification.details);
                        Poll::Ready(verification.result)
                    }
                };
            }
        }

        let request = VerifyRequest {
            cert: server_cert,
            host: self.host_and_port.host.clone(),
            flags: VerifyFlags {
                rev_checking: self.config.rev_checking,
                ev_cert: self.config.verify_ev_cert,
            },
        };
        let mut verifier = SingleRequestVerifier::new(Arc::clone(&self.context.cert_verifier));
        match verifier.verify(request, self.verify_callback(st.generation)) {
            Poll::Pending => {
                st.verifier = Some(verifier);
                Poll::Pending
            }
            Poll::Ready(verification) => {
                st.verify_result = Some(verification.details);
                Poll::Ready(verification.result)
            }
        }
    }

    fn do_verify_cert_complete(
        &self,
        st: &mut SocketState,
        mut result: Result<(), NetError>,
    ) -> Poll<Result<(), NetError>> {
        st.verifier = None;
        st.completed_handshake = true;

        let details = st.verify_result.clone().unwrap_or_default();
        let minor = match &result {
            Ok(()) => true,
            Err(e) => e.is_certificate_error() && details.cert_status.is_minor_error(),
        };
        let Some(security) = &self.context.transport_security_state else {
            return Poll::Ready(result);
        };
        if !minor || !details.is_issued_by_known_root {
            return Poll::Ready(result);
        }

        let host = &self.host_and_port.host;
        if let Some(check) = check_pins(
            security.as_ref(),
            host,
            self.config.sni_available(),
            &details.public_key_hashes,
            &self.context.pin_policy,
            SystemTime::now(),
        ) {
            let enforced = check.enforced && self.config.pin_enforcement;
            self.add_event(SocketEvent::PublicKeyPinCheck {
                host: host.clone(),
                permitted: check.permitted,
                enforced,
            });
            if !check.permitted {
                if enforced {
                    result = Err(NetError::PinnedKeyNotInChain);
                } else {
                    log::warn!("public key pins for {host} not enforced");
                    st.pin_override_active = true;
                }
            }
        }
        Poll::Ready(result)
    }

    /// Remembers the server's chain so the next connection can start
    /// verifying early.
    fn save_host_info(&self, core: &Core) {
        let Some(info) = &self.context.ssl_host_info else {
            return;
        };
        if info.wait_for_data_ready(None) != Poll::Ready(Ok(())) {
            return;
        }
        let chain = core.state().server_cert_chain.clone();
        if chain.certs().iter().any(|c| c.len() > MAX_SAVED_CERT_LEN) {
            return;
        }
        info.set_certs(chain.certs().to_vec());
        info.persist();
    }
}
