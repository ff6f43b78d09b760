//! Engine-domain half of the Core: the handshake, read and write loops and
//! the hooks the engine calls while they run.

use std::sync::Arc;
use std::task::Poll;
use std::time::SystemTime;

use tlsock_types::{map_client_error, map_client_handshake_error, EngineError, NetError};

use super::{Core, CorePort, State};
use crate::bio::MemoryBio;
use crate::cert_verify::OcspResponseCache;
use crate::client_auth::{self, BoundCert, ClientAuthOutcome, ClientCertStore};
use crate::config::{ConnectionConfig, EngineSettings};
use crate::engine::{
    ClientAuthDecision, ClientAuthRequest, Engine, EngineHooks, HandshakeSummary,
};
use crate::events::SocketEvent;
use crate::handshake_state::{negotiate_next_protocol, HandshakeState};
use crate::relay::BufferRelay;
use crate::HostPortPair;

/// Handshake bookkeeping the engine hooks are allowed to touch.
pub(super) struct HandshakeContext {
    config: Arc<ConnectionConfig>,
    host_and_port: HostPortPair,
    cert_store: Arc<dyn ClientCertStore>,
    ocsp_cache: Option<Arc<dyn OcspResponseCache>>,
    settings: Option<EngineSettings>,
    pub(super) predicted_certs: Vec<Vec<u8>>,
    next_state: State,
    bound_cert_negotiated: bool,
    client_auth_cert_needed: bool,
    pub(super) handshake_callback_called: bool,
    pub(super) bound_cert: Option<BoundCert>,
    state: HandshakeState,
}

impl HandshakeContext {
    pub(super) fn new(
        config: Arc<ConnectionConfig>,
        host_and_port: HostPortPair,
        cert_store: Arc<dyn ClientCertStore>,
        ocsp_cache: Option<Arc<dyn OcspResponseCache>>,
    ) -> Self {
        Self {
            config,
            host_and_port,
            cert_store,
            ocsp_cache,
            settings: None,
            predicted_certs: Vec::new(),
            next_state: State::None,
            bound_cert_negotiated: false,
            client_auth_cert_needed: false,
            handshake_callback_called: false,
            bound_cert: None,
            state: HandshakeState::default(),
        }
    }

    /// Forgets everything the previous handshake attempt learned.
    fn reset_attempt(&mut self) {
        self.predicted_certs.clear();
        self.next_state = State::None;
        self.bound_cert_negotiated = false;
        self.client_auth_cert_needed = false;
        self.handshake_callback_called = false;
        self.bound_cert = None;
        self.state = HandshakeState::default();
    }

    /// Maps an engine error, dropping a cached client key that stopped
    /// working. `None` means the operation should wait for I/O.
    fn map_error(&self, err: EngineError, during_handshake: bool) -> Option<NetError> {
        let mapped = if during_handshake {
            map_client_handshake_error(err)
        } else {
            map_client_error(err)
        }?;
        if mapped.is_client_credential_failure() {
            if let Some(cert) = &self.config.client_cert {
                self.cert_store.invalidate_cached_key(cert);
            }
        }
        Some(mapped)
    }
}

pub(super) struct EngineSide {
    pub(super) engine: Option<Box<dyn Engine>>,
    pub(super) bio: MemoryBio,
    pub(super) relay: BufferRelay,
    pub(super) ctx: HandshakeContext,
    pub(super) user_read_buf: Option<Vec<u8>>,
    pub(super) user_write_buf: Option<Vec<u8>>,
}

impl EngineSide {
    pub(super) fn new(ctx: HandshakeContext) -> Self {
        Self {
            engine: None,
            bio: MemoryBio::default(),
            relay: BufferRelay::new(),
            ctx,
            user_read_buf: None,
            user_write_buf: None,
        }
    }

    /// Installs a fresh engine for the next handshake attempt.
    ///
    /// Transport operations still in flight keep their relay and BIO so
    /// their completions stay accounted for.
    pub(super) fn install(&mut self, engine: Box<dyn Engine>, settings: EngineSettings) {
        self.engine = Some(engine);
        self.ctx.settings = Some(settings);
        self.ctx.reset_attempt();
        if !self.relay.is_busy() {
            self.bio.reset();
            self.relay = BufferRelay::new();
        }
    }

    /// Configures the engine on first use and arms the state machine.
    pub(super) fn start_handshake(&mut self, core: &Arc<Core>) -> Result<(), NetError> {
        let engine = self
            .engine
            .as_deref_mut()
            .ok_or_else(|| NetError::Unexpected("engine not initialised".into()))?;
        if let Some(settings) = self.ctx.settings.take() {
            if let Err(e) = engine.configure(&settings) {
                let error = self
                    .ctx
                    .map_error(e, true)
                    .unwrap_or_else(|| NetError::Unexpected("configure would block".into()));
                core.add_event(SocketEvent::HandshakeError {
                    error: error.clone(),
                });
                return Err(error);
            }
        }
        if self.ctx.next_state != State::None {
            return Err(NetError::Unexpected("handshake already in progress".into()));
        }
        self.ctx.next_state = State::Handshake;
        Ok(())
    }

    fn do_transport_io(&mut self, core: &Arc<Core>) -> bool {
        self.relay.pump(&mut self.bio, &CorePort(core))
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    pub(super) fn do_handshake_loop(
        &mut self,
        core: &Arc<Core>,
        last_io_result: Result<(), NetError>,
    ) -> Poll<Result<(), NetError>> {
        let mut rv = Poll::Ready(last_io_result);
        loop {
            let state = self.ctx.next_state;
            self.ctx.next_state = State::None;
            rv = match state {
                State::Handshake => self.do_handshake(core),
                State::GetBoundCertComplete => {
                    let input = match rv {
                        Poll::Ready(result) => result,
                        Poll::Pending => Ok(()),
                    };
                    self.do_get_bound_cert_complete(input)
                }
                State::None => Poll::Ready(Err(NetError::Unexpected(
                    "handshake loop entered without a state".into(),
                ))),
            };

            let moved = self.do_transport_io(core);
            // Bytes moved, so the engine may be able to progress now.
            if moved && rv.is_pending() && self.ctx.next_state == State::Handshake {
                rv = Poll::Ready(Ok(()));
            }
            if rv.is_pending() || self.ctx.next_state == State::None {
                return rv;
            }
        }
    }

    fn do_handshake(&mut self, core: &Arc<Core>) -> Poll<Result<(), NetError>> {
        let Some(engine) = self.engine.as_deref_mut() else {
            return Poll::Ready(Err(NetError::Unexpected("engine not initialised".into())));
        };
        let rv = {
            let mut hooks = Hooks {
                core,
                ctx: &mut self.ctx,
            };
            engine.handshake(&mut self.bio, &mut hooks)
        };

        if self.ctx.client_auth_cert_needed {
            if self.ctx.bound_cert_negotiated {
                self.ctx.next_state = State::GetBoundCertComplete;
                return Poll::Pending;
            }
            let error = NetError::ClientAuthCertNeeded;
            core.add_event(SocketEvent::HandshakeError {
                error: error.clone(),
            });
            if rv.is_ok() {
                // The server let us in without a certificate; a retry must
                // not resume this session and skip the certificate prompt.
                if let Err(e) = engine.invalidate_session() {
                    log::warn!("failed to invalidate session: {e}");
                }
            }
            return Poll::Ready(Err(error));
        }

        match rv {
            Ok(()) if !self.ctx.handshake_callback_called => {
                let error = NetError::ProtocolError(
                    "engine reported success before the handshake completed".into(),
                );
                log::warn!("{error}");
                core.add_event(SocketEvent::HandshakeError {
                    error: error.clone(),
                });
                Poll::Ready(Err(error))
            }
            Ok(()) => {
                if self.ctx.config.ocsp_stapling && !self.ctx.state.predicted_chain_matched {
                    if let (Some(cache), Some(leaf)) =
                        (&self.ctx.ocsp_cache, self.ctx.state.server_cert_chain.leaf())
                    {
                        if let Some(response) = engine.stapled_ocsp_response() {
                            cache.cache_response(leaf, &response, SystemTime::now());
                        }
                    }
                }
                Poll::Ready(Ok(()))
            }
            Err(e) => match self.ctx.map_error(e, true) {
                None => {
                    self.ctx.next_state = State::Handshake;
                    Poll::Pending
                }
                Some(error) => {
                    core.add_event(SocketEvent::HandshakeError {
                        error: error.clone(),
                    });
                    Poll::Ready(Err(error))
                }
            },
        }
    }

    fn do_get_bound_cert_complete(
        &mut self,
        result: Result<(), NetError>,
    ) -> Poll<Result<(), NetError>> {
        self.ctx.client_auth_cert_needed = false;
        self.ctx.state.client_cert_type = None;
        let Some(engine) = self.engine.as_deref_mut() else {
            return Poll::Ready(Err(NetError::Unexpected("engine not initialised".into())));
        };

        let credential = match result {
            Err(e) => {
                log::debug!("no bound certificate, continuing without one: {e}");
                None
            }
            Ok(()) => {
                let Some(bound) = self.ctx.bound_cert.take() else {
                    return Poll::Ready(Err(NetError::Unexpected(
                        "bound certificate missing".into(),
                    )));
                };
                match client_auth::import_bound_cert(&bound) {
                    Ok(credential) => {
                        self.ctx.state.client_cert_type = Some(bound.cert_type);
                        Some(credential)
                    }
                    Err(e) => return Poll::Ready(Err(e)),
                }
            }
        };
        let cert_count = credential.as_ref().and_then(|c| c.cert_count);
        let sent = credential.is_some();

        if let Err(e) = engine.restart_after_cert_request(credential) {
            let error = self
                .ctx
                .map_error(e, true)
                .unwrap_or_else(|| NetError::Unexpected("restart would block".into()));
            return Poll::Ready(Err(error));
        }
        if sent {
            log::debug!("resumed handshake with bound certificate ({cert_count:?} certs)");
        }
        self.ctx.next_state = State::Handshake;
        Poll::Ready(Ok(()))
    }

    pub(super) fn on_handshake_io_complete(
        &mut self,
        core: &Arc<Core>,
        result: Result<(), NetError>,
    ) {
        if let Poll::Ready(result) = self.do_handshake_loop(core, result) {
            core.deliver(|net| &mut net.connect_callback, result);
        }
    }

    // -----------------------------------------------------------------------
    // Payload
    // -----------------------------------------------------------------------

    pub(super) fn do_read_loop(
        &mut self,
        core: &Arc<Core>,
        result: Result<(), NetError>,
    ) -> Poll<Result<usize, NetError>> {
        if let Err(e) = result {
            return Poll::Ready(Err(e));
        }
        loop {
            let rv = self.do_payload_read(core);
            let moved = self.do_transport_io(core);
            if !(rv.is_pending() && moved) {
                return rv;
            }
        }
    }

    pub(super) fn do_write_loop(
        &mut self,
        core: &Arc<Core>,
        result: Result<(), NetError>,
    ) -> Poll<Result<usize, NetError>> {
        if let Err(e) = result {
            return Poll::Ready(Err(e));
        }
        loop {
            let rv = self.do_payload_write(core);
            let moved = self.do_transport_io(core);
            if !(rv.is_pending() && moved) {
                return rv;
            }
        }
    }

    fn do_payload_read(&mut self, core: &Arc<Core>) -> Poll<Result<usize, NetError>> {
        let (Some(engine), Some(buf)) = (self.engine.as_deref_mut(), self.user_read_buf.as_mut())
        else {
            return Poll::Ready(Err(NetError::Unexpected("no read in progress".into())));
        };
        let rv = {
            let mut hooks = Hooks {
                core,
                ctx: &mut self.ctx,
            };
            engine.read(&mut self.bio, &mut hooks, buf)
        };

        if self.ctx.client_auth_cert_needed {
            // Renegotiation asked for a client certificate we cannot supply.
            let error = NetError::ClientAuthCertNeeded;
            core.add_event(SocketEvent::ReadError {
                error: error.clone(),
            });
            return Poll::Ready(Err(error));
        }
        match rv {
            Ok(n) => {
                core.add_event(SocketEvent::BytesReceived { len: n });
                Poll::Ready(Ok(n))
            }
            Err(e) => match self.ctx.map_error(e, false) {
                None => Poll::Pending,
                Some(error) => {
                    core.add_event(SocketEvent::ReadError {
                        error: error.clone(),
                    });
                    Poll::Ready(Err(error))
                }
            },
        }
    }

    fn do_payload_write(&mut self, core: &Arc<Core>) -> Poll<Result<usize, NetError>> {
        let (Some(engine), Some(data)) = (self.engine.as_deref_mut(), self.user_write_buf.as_ref())
        else {
            return Poll::Ready(Err(NetError::Unexpected("no write in progress".into())));
        };
        let rv = {
            let mut hooks = Hooks {
                core,
                ctx: &mut self.ctx,
            };
            engine.write(&mut self.bio, &mut hooks, data)
        };
        match rv {
            Ok(n) => {
                core.add_event(SocketEvent::BytesSent { len: n });
                Poll::Ready(Ok(n))
            }
            Err(e) => match self.ctx.map_error(e, false) {
                None => Poll::Pending,
                Some(error) => {
                    core.add_event(SocketEvent::WriteError {
                        error: error.clone(),
                    });
                    Poll::Ready(Err(error))
                }
            },
        }
    }

    /// Returns the user's read buffer trimmed to what was read.
    pub(super) fn finish_read(&mut self, result: Result<usize, NetError>) -> Result<Vec<u8>, NetError> {
        let buf = self.user_read_buf.take();
        let n = result?;
        let mut buf = buf.ok_or_else(|| NetError::Unexpected("read buffer lost".into()))?;
        buf.truncate(n);
        Ok(buf)
    }

    // -----------------------------------------------------------------------
    // Transport completions
    // -----------------------------------------------------------------------

    pub(super) fn on_recv_complete(&mut self, core: &Arc<Core>, result: Result<(), NetError>) {
        if self.ctx.next_state == State::Handshake {
            self.on_handshake_io_complete(core, result);
            return;
        }
        if self.user_read_buf.is_none() {
            return;
        }
        if let Poll::Ready(rv) = self.do_read_loop(core, result) {
            let result = self.finish_read(rv);
            core.deliver(|net| &mut net.read_callback, result);
        }
    }

    pub(super) fn on_send_complete(&mut self, core: &Arc<Core>, result: Result<(), NetError>) {
        if self.ctx.next_state == State::Handshake {
            self.on_handshake_io_complete(core, result);
            return;
        }
        // Outside a handshake a peer-initiated renegotiation may need reads
        // and writes to make progress, so both are serviced here.
        let mut rv_read = Poll::Pending;
        let mut rv_write = Poll::Pending;
        loop {
            if self.user_read_buf.is_some() {
                rv_read = self.do_payload_read(core);
            }
            if self.user_write_buf.is_some() {
                rv_write = self.do_payload_write(core);
            }
            let moved = self.do_transport_io(core);
            let waiting = self.user_read_buf.is_some() || self.user_write_buf.is_some();
            if !(rv_read.is_pending() && rv_write.is_pending() && waiting && moved) {
                break;
            }
        }
        if self.user_read_buf.is_some() {
            if let Poll::Ready(rv) = rv_read {
                let result = self.finish_read(rv);
                core.deliver(|net| &mut net.read_callback, result);
            }
        }
        if self.user_write_buf.is_some() {
            if let Poll::Ready(rv) = rv_write {
                self.user_write_buf = None;
                core.deliver(|net| &mut net.write_callback, rv);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine hooks
// ---------------------------------------------------------------------------

/// The hooks handed to the engine for the duration of one engine call.
struct Hooks<'a> {
    core: &'a Arc<Core>,
    ctx: &'a mut HandshakeContext,
}

impl Hooks<'_> {
    fn bound_cert_client_auth(&mut self, request: &ClientAuthRequest) -> ClientAuthDecision {
        self.ctx.bound_cert_negotiated = true;
        let origin = client_auth::bound_cert_origin(&self.ctx.host_and_port);
        let requested_types = request.cert_types.clone();

        let rv = if self.core.on_network_runner() {
            self.core.do_get_bound_cert(origin, requested_types)
        } else {
            let core = Arc::clone(self.core);
            if self.core.network_runner.post_task(Box::new(move || {
                let _ = core.do_get_bound_cert(origin, requested_types);
            })) {
                Poll::Pending
            } else {
                Poll::Ready(Err(NetError::Aborted))
            }
        };

        match rv {
            Poll::Pending => {
                self.ctx.client_auth_cert_needed = true;
                ClientAuthDecision::Suspend
            }
            Poll::Ready(Ok(bound)) => match client_auth::import_bound_cert(&bound) {
                Ok(credential) => {
                    self.ctx.state.client_cert_type = Some(bound.cert_type);
                    self.core.add_event(SocketEvent::ClientCertProvided {
                        cert_count: credential.cert_count,
                    });
                    ClientAuthDecision::Provide(credential)
                }
                Err(e) => {
                    log::warn!("unusable bound certificate: {e}");
                    ClientAuthDecision::NoCertificate
                }
            },
            Poll::Ready(Err(e)) => {
                log::debug!("bound certificate lookup failed: {e}");
                ClientAuthDecision::NoCertificate
            }
        }
    }
}

impl EngineHooks for Hooks<'_> {
    fn client_auth_requested(&mut self, request: &ClientAuthRequest) -> ClientAuthDecision {
        self.core.add_event(SocketEvent::ClientCertRequested);
        if request.bound_cert_negotiated {
            return self.bound_cert_client_auth(request);
        }

        let outcome = client_auth::negotiate(
            &self.ctx.config,
            self.ctx.cert_store.as_ref(),
            request,
            SystemTime::now(),
        );
        match outcome {
            ClientAuthOutcome::Provide(credential) => {
                self.core.add_event(SocketEvent::ClientCertProvided {
                    cert_count: credential.cert_count,
                });
                ClientAuthDecision::Provide(credential)
            }
            ClientAuthOutcome::NoCertificate => {
                self.core.add_event(SocketEvent::ClientCertProvided {
                    cert_count: Some(0),
                });
                ClientAuthDecision::NoCertificate
            }
            ClientAuthOutcome::Candidates(certs) => {
                self.ctx.client_auth_cert_needed = true;
                self.ctx.state.client_certs = certs;
                self.core.publish_state(self.ctx.state.clone());
                ClientAuthDecision::Suspend
            }
        }
    }

    fn select_next_protocol(&mut self, server_protos: &[u8]) -> Result<Vec<u8>, EngineError> {
        let (status, proto, advertised) =
            negotiate_next_protocol(&self.ctx.config.next_protos, server_protos)?;
        self.ctx.state.next_proto_status = status;
        self.ctx.state.next_proto = proto.clone();
        self.ctx.state.server_protos = advertised;
        self.core.publish_state(self.ctx.state.clone());
        Ok(proto)
    }

    fn handshake_completed(&mut self, summary: &HandshakeSummary) {
        self.ctx.handshake_callback_called = true;
        self.ctx.state.apply_summary(
            summary,
            self.ctx.config.version_fallback,
            &self.ctx.predicted_certs,
        );
        if !summary.resumed {
            log::debug!(
                "full handshake with {} (bound certs negotiated: {})",
                self.ctx.host_and_port,
                self.ctx.bound_cert_negotiated
            );
        }
        if self.ctx.state.server_cert.is_some() {
            self.core.add_event(SocketEvent::CertificatesReceived {
                count: self.ctx.state.server_cert_chain.len(),
            });
        }
        self.core.publish_state(self.ctx.state.clone());
    }
}
