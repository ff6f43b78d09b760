//! The Core: handshake/connect state machine shared between the transport
//! domain and the engine domain.
//!
//! Each domain owns one half of the Core's state behind its own mutex:
//! [`EngineSide`] is only locked on the engine domain and [`NetworkSide`]
//! is only locked on the transport domain (briefly, never while waiting on
//! anything). The halves talk by posting tasks to each other's runner.
//! User callbacks are always posted to the transport domain and are dropped
//! if the Core was detached before they run.

mod engine_side;

use std::sync::{Arc, Mutex};
use std::task::Poll;

use tlsock_types::{map_client_error, NetError};

use crate::cert_verify::OcspResponseCache;
use crate::client_auth::{BoundCert, BoundCertRequest, BoundCertService, ClientCertStore, RequestHandle};
use crate::config::{ConnectionConfig, EngineSettings};
use crate::engine::Engine;
use crate::events::{EventSink, SocketEvent};
use crate::handshake_state::HandshakeState;
use crate::relay::RelayPort;
use crate::runner::{lock, TaskRunner};
use crate::transport::SharedTransport;
use crate::{CompletionCallback, HostPortPair};

use self::engine_side::{EngineSide, HandshakeContext};

/// Position in the handshake state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    None,
    Handshake,
    GetBoundCertComplete,
}

/// Everything a [`Core`] is built from.
pub struct CoreParams {
    pub host_and_port: HostPortPair,
    pub config: Arc<ConnectionConfig>,
    pub network_runner: Arc<dyn TaskRunner>,
    pub engine_runner: Arc<dyn TaskRunner>,
    pub transport: SharedTransport,
    pub cert_store: Arc<dyn ClientCertStore>,
    pub bound_cert_service: Option<Arc<dyn BoundCertService>>,
    pub ocsp_cache: Option<Arc<dyn OcspResponseCache>>,
    pub event_sink: Arc<dyn EventSink>,
}

/// Transport-domain half.
struct NetworkSide {
    detached: bool,
    transport: Option<SharedTransport>,
    event_sink: Arc<dyn EventSink>,
    bound_cert_service: Option<Arc<dyn BoundCertService>>,
    bound_cert_request: Option<RequestHandle>,
    /// Set while a bound certificate fetch has not completed.
    bound_cert_in_flight: bool,
    state: Arc<HandshakeState>,
    connect_callback: Option<CompletionCallback<()>>,
    read_callback: Option<CompletionCallback<Vec<u8>>>,
    write_callback: Option<CompletionCallback<usize>>,
}

type Slot<T> = fn(&mut NetworkSide) -> &mut Option<CompletionCallback<T>>;

/// Drives one TLS connection attempt.
pub struct Core {
    network_runner: Arc<dyn TaskRunner>,
    engine_runner: Arc<dyn TaskRunner>,
    engine: Mutex<EngineSide>,
    network: Mutex<NetworkSide>,
}

impl Core {
    pub fn new(params: CoreParams) -> Arc<Self> {
        let ctx = HandshakeContext::new(
            params.config,
            params.host_and_port,
            params.cert_store,
            params.ocsp_cache,
        );
        Arc::new(Self {
            network_runner: params.network_runner,
            engine_runner: params.engine_runner,
            engine: Mutex::new(EngineSide::new(ctx)),
            network: Mutex::new(NetworkSide {
                detached: false,
                transport: Some(params.transport),
                event_sink: params.event_sink,
                bound_cert_service: params.bound_cert_service,
                bound_cert_request: None,
                bound_cert_in_flight: false,
                state: Arc::new(HandshakeState::default()),
                connect_callback: None,
                read_callback: None,
                write_callback: None,
            }),
        })
    }

    /// Hands the Core its engine. The engine is configured with `settings`
    /// on the engine domain when `connect` runs.
    pub fn init(&self, engine: Box<dyn Engine>, settings: EngineSettings) {
        lock(&self.engine).install(engine, settings);
        lock(&self.network).state = Arc::new(HandshakeState::default());
    }

    /// Seeds the certificate chain the server is expected to send.
    pub fn set_predicted_certificates(&self, certs: Vec<Vec<u8>>) {
        lock(&self.engine).ctx.predicted_certs = certs;
    }

    fn on_network_runner(&self) -> bool {
        self.network_runner.runs_tasks_on_current_thread()
    }

    fn on_engine_runner(&self) -> bool {
        self.engine_runner.runs_tasks_on_current_thread()
    }

    pub fn is_detached(&self) -> bool {
        lock(&self.network).detached
    }

    /// Most recently published handshake state.
    pub fn state(&self) -> Arc<HandshakeState> {
        Arc::clone(&lock(&self.network).state)
    }

    // -----------------------------------------------------------------------
    // Public operations (transport domain)
    // -----------------------------------------------------------------------

    /// Starts the handshake.
    ///
    /// # Panics
    ///
    /// If a connect, read or write is already pending.
    pub fn connect(self: &Arc<Self>, callback: CompletionCallback<()>) -> Poll<Result<(), NetError>> {
        {
            let mut net = lock(&self.network);
            if net.detached {
                return Poll::Ready(Err(NetError::Aborted));
            }
            assert!(
                net.connect_callback.is_none()
                    && net.read_callback.is_none()
                    && net.write_callback.is_none(),
                "connect while another operation is pending"
            );
            net.connect_callback = Some(callback);
        }
        if !self.on_engine_runner() {
            let core = Arc::clone(self);
            if self.engine_runner.post_task(Box::new(move || {
                let _ = core.connect_on_engine();
            })) {
                return Poll::Pending;
            }
            lock(&self.network).connect_callback = None;
            return Poll::Ready(Err(NetError::Aborted));
        }
        self.connect_on_engine()
    }

    /// Reads up to `buf.len()` bytes of application data. The returned
    /// buffer is `buf` truncated to the bytes read; empty means EOF.
    ///
    /// # Panics
    ///
    /// If a connect or another read is pending.
    pub fn read(
        self: &Arc<Self>,
        buf: Vec<u8>,
        callback: CompletionCallback<Vec<u8>>,
    ) -> Poll<Result<Vec<u8>, NetError>> {
        if buf.is_empty() {
            return Poll::Ready(Err(NetError::InvalidArgument("empty read buffer".into())));
        }
        {
            let mut net = lock(&self.network);
            if net.detached {
                return Poll::Ready(Err(NetError::Aborted));
            }
            assert!(net.connect_callback.is_none(), "read while connect is pending");
            assert!(net.read_callback.is_none(), "read while another read is pending");
            net.read_callback = Some(callback);
        }
        if !self.on_engine_runner() {
            let core = Arc::clone(self);
            if self.engine_runner.post_task(Box::new(move || {
                let _ = core.read_on_engine(buf);
            })) {
                return Poll::Pending;
            }
            lock(&self.network).read_callback = None;
            return Poll::Ready(Err(NetError::Aborted));
        }
        self.read_on_engine(buf)
    }

    /// Writes application data, returning how many bytes were accepted.
    ///
    /// # Panics
    ///
    /// If a connect or another write is pending.
    pub fn write(
        self: &Arc<Self>,
        data: Vec<u8>,
        callback: CompletionCallback<usize>,
    ) -> Poll<Result<usize, NetError>> {
        if data.is_empty() {
            return Poll::Ready(Err(NetError::InvalidArgument("empty write buffer".into())));
        }
        {
            let mut net = lock(&self.network);
            if net.detached {
                return Poll::Ready(Err(NetError::Aborted));
            }
            assert!(net.connect_callback.is_none(), "write while connect is pending");
            assert!(net.write_callback.is_none(), "write while another write is pending");
            net.write_callback = Some(callback);
        }
        if !self.on_engine_runner() {
            let core = Arc::clone(self);
            if self.engine_runner.post_task(Box::new(move || {
                let _ = core.write_on_engine(data);
            })) {
                return Poll::Pending;
            }
            lock(&self.network).write_callback = None;
            return Poll::Ready(Err(NetError::Aborted));
        }
        self.write_on_engine(data)
    }

    /// Makes the Core inert. No callback fires after this returns, the
    /// transport is released and any bound certificate request is
    /// cancelled. Idempotent.
    pub fn detach(&self) {
        let (service, request, callbacks) = {
            let mut net = lock(&self.network);
            if net.detached {
                return;
            }
            net.detached = true;
            net.transport = None;
            net.state = Arc::new(HandshakeState::default());
            let callbacks = (
                net.connect_callback.take(),
                net.read_callback.take(),
                net.write_callback.take(),
            );
            (net.bound_cert_service.clone(), net.bound_cert_request.take(), callbacks)
        };
        if let (Some(service), Some(handle)) = (service, request) {
            service.cancel_request(handle);
        }
        drop(callbacks);
    }

    /// Exports keying material. Blocks while the engine domain is busy.
    pub fn export_keying_material(
        &self,
        label: &str,
        context: Option<&[u8]>,
        out_len: usize,
    ) -> Result<Vec<u8>, NetError> {
        let mut side = lock(&self.engine);
        let engine = side
            .engine
            .as_deref_mut()
            .ok_or(NetError::SocketNotConnected)?;
        engine
            .export_keying_material(label, context, out_len)
            .map_err(|e| {
                map_client_error(e)
                    .unwrap_or_else(|| NetError::Unexpected("export would block".into()))
            })
    }

    // -----------------------------------------------------------------------
    // Engine-domain entry points
    // -----------------------------------------------------------------------

    fn connect_on_engine(self: &Arc<Self>) -> Poll<Result<(), NetError>> {
        let rv = {
            let mut side = lock(&self.engine);
            match side.start_handshake(self) {
                Ok(()) => side.do_handshake_loop(self, Ok(())),
                Err(e) => Poll::Ready(Err(e)),
            }
        };
        self.finish(|net| &mut net.connect_callback, rv)
    }

    fn read_on_engine(self: &Arc<Self>, buf: Vec<u8>) -> Poll<Result<Vec<u8>, NetError>> {
        let rv = {
            let mut side = lock(&self.engine);
            if !side.ctx.handshake_callback_called {
                Poll::Ready(Err(NetError::SocketNotConnected))
            } else {
                side.user_read_buf = Some(buf);
                match side.do_read_loop(self, Ok(())) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(result) => Poll::Ready(side.finish_read(result)),
                }
            }
        };
        self.finish(|net| &mut net.read_callback, rv)
    }

    fn write_on_engine(self: &Arc<Self>, data: Vec<u8>) -> Poll<Result<usize, NetError>> {
        let rv = {
            let mut side = lock(&self.engine);
            if !side.ctx.handshake_callback_called {
                Poll::Ready(Err(NetError::SocketNotConnected))
            } else {
                side.user_write_buf = Some(data);
                let rv = side.do_write_loop(self, Ok(()));
                if rv.is_ready() {
                    side.user_write_buf = None;
                }
                rv
            }
        };
        self.finish(|net| &mut net.write_callback, rv)
    }

    fn buffer_recv_complete(self: &Arc<Self>, result: Result<Vec<u8>, NetError>) {
        if !self.on_engine_runner() {
            if self.is_detached() {
                return;
            }
            let core = Arc::clone(self);
            self.engine_runner
                .post_task(Box::new(move || core.buffer_recv_complete(result)));
            return;
        }
        let mut guard = lock(&self.engine);
        let side = &mut *guard;
        let outcome = side.relay.recv_complete(&mut side.bio, result).map(|_| ());
        side.on_recv_complete(self, outcome);
    }

    fn buffer_send_complete(self: &Arc<Self>, result: Result<usize, NetError>) {
        if !self.on_engine_runner() {
            if self.is_detached() {
                return;
            }
            let core = Arc::clone(self);
            self.engine_runner
                .post_task(Box::new(move || core.buffer_send_complete(result)));
            return;
        }
        let mut guard = lock(&self.engine);
        let side = &mut *guard;
        side.relay.send_complete(&mut side.bio, result.clone());
        side.on_send_complete(self, result.map(|_| ()));
    }

    fn bound_cert_ready(self: &Arc<Self>, result: Result<BoundCert, NetError>) {
        if !self.on_engine_runner() {
            if self.is_detached() {
                return;
            }
            let core = Arc::clone(self);
            self.engine_runner
                .post_task(Box::new(move || core.bound_cert_ready(result)));
            return;
        }
        let mut side = lock(&self.engine);
        let io_result = result.map(|cert| side.ctx.bound_cert = Some(cert));
        side.on_handshake_io_complete(self, io_result);
    }

    // -----------------------------------------------------------------------
    // Transport-domain work requested by the engine domain
    // -----------------------------------------------------------------------

    fn do_buffer_recv(self: &Arc<Self>, len: usize) -> Poll<Result<Vec<u8>, NetError>> {
        let transport = {
            let net = lock(&self.network);
            if net.detached {
                None
            } else {
                net.transport.clone()
            }
        };
        let rv = match transport {
            None => Poll::Ready(Err(NetError::Aborted)),
            Some(transport) => {
                let core = Arc::clone(self);
                lock(&transport).read(len, Box::new(move |r| core.buffer_recv_complete(r)))
            }
        };
        match rv {
            Poll::Ready(result) if !self.on_engine_runner() => {
                self.buffer_recv_complete(result);
                Poll::Pending
            }
            rv => rv,
        }
    }

    fn do_buffer_send(self: &Arc<Self>, data: Vec<u8>) -> Poll<Result<usize, NetError>> {
        let transport = {
            let net = lock(&self.network);
            if net.detached {
                None
            } else {
                net.transport.clone()
            }
        };
        let rv = match transport {
            None => Poll::Ready(Err(NetError::Aborted)),
            Some(transport) => {
                let core = Arc::clone(self);
                lock(&transport).write(data, Box::new(move |r| core.buffer_send_complete(r)))
            }
        };
        match rv {
            Poll::Ready(result) if !self.on_engine_runner() => {
                self.buffer_send_complete(result);
                Poll::Pending
            }
            rv => rv,
        }
    }

    fn do_get_bound_cert(
        self: &Arc<Self>,
        origin: String,
        requested_types: Vec<u8>,
    ) -> Poll<Result<BoundCert, NetError>> {
        let service = {
            let mut net = lock(&self.network);
            if net.detached {
                return Poll::Ready(Err(NetError::Aborted));
            }
            net.bound_cert_in_flight = net.bound_cert_service.is_some();
            net.bound_cert_service.clone()
        };
        self.add_event(SocketEvent::BoundCertFetchBegin {
            origin: origin.clone(),
        });

        let rv = match service {
            None => Poll::Ready(Err(NetError::Unexpected(
                "no bound certificate service".into(),
            ))),
            Some(service) => {
                let core = Arc::clone(self);
                let request = service.get_bound_cert(
                    &origin,
                    &requested_types,
                    Box::new(move |r| core.on_get_bound_cert_complete(r)),
                );
                match request {
                    BoundCertRequest::Pending(handle) => {
                        let cancel = {
                            let mut net = lock(&self.network);
                            if !net.bound_cert_in_flight {
                                // Already completed on another thread.
                                false
                            } else if net.detached {
                                net.bound_cert_in_flight = false;
                                true
                            } else {
                                net.bound_cert_request = Some(handle);
                                false
                            }
                        };
                        if cancel {
                            service.cancel_request(handle);
                        }
                        Poll::Pending
                    }
                    BoundCertRequest::Ready(result) => {
                        lock(&self.network).bound_cert_in_flight = false;
                        Poll::Ready(result)
                    }
                }
            }
        };

        match rv {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.add_event(SocketEvent::BoundCertFetchEnd {
                    result: result.as_ref().map(|_| ()).map_err(Clone::clone),
                });
                if self.on_engine_runner() {
                    Poll::Ready(result)
                } else {
                    self.bound_cert_ready(result);
                    Poll::Pending
                }
            }
        }
    }

    fn on_get_bound_cert_complete(self: &Arc<Self>, result: Result<BoundCert, NetError>) {
        {
            let mut net = lock(&self.network);
            net.bound_cert_request = None;
            net.bound_cert_in_flight = false;
            if net.detached {
                return;
            }
        }
        self.add_event(SocketEvent::BoundCertFetchEnd {
            result: result.as_ref().map(|_| ()).map_err(Clone::clone),
        });
        self.bound_cert_ready(result);
    }

    // -----------------------------------------------------------------------
    // Marshalling helpers
    // -----------------------------------------------------------------------

    /// Runs `task` now when on the transport domain, otherwise posts it.
    /// Skipped once detached.
    fn post_or_run(self: &Arc<Self>, task: impl FnOnce(&Arc<Core>) + Send + 'static) {
        if self.on_network_runner() {
            if !self.is_detached() {
                task(self);
            }
            return;
        }
        let core = Arc::clone(self);
        self.network_runner.post_task(Box::new(move || {
            if !core.is_detached() {
                task(&core);
            }
        }));
    }

    fn publish_state(self: &Arc<Self>, state: HandshakeState) {
        self.post_or_run(move |core| {
            let mut net = lock(&core.network);
            if !net.detached {
                net.state = Arc::new(state);
            }
        });
    }

    fn add_event(self: &Arc<Self>, event: SocketEvent) {
        self.post_or_run(move |core| {
            let sink = Arc::clone(&lock(&core.network).event_sink);
            sink.add_event(&event);
        });
    }

    /// Posts a user callback invocation to the transport domain.
    fn deliver<T: Send + 'static>(self: &Arc<Self>, slot: Slot<T>, result: Result<T, NetError>) {
        let core = Arc::clone(self);
        self.network_runner.post_task(Box::new(move || {
            let callback = {
                let mut net = lock(&core.network);
                if net.detached {
                    return;
                }
                slot(&mut net).take()
            };
            if let Some(callback) = callback {
                callback(result);
            }
        }));
    }

    /// Completes an operation that started on the engine domain: returned
    /// directly when the caller is on the transport domain, otherwise
    /// delivered through the stored callback.
    fn finish<T: Send + 'static>(
        self: &Arc<Self>,
        slot: Slot<T>,
        rv: Poll<Result<T, NetError>>,
    ) -> Poll<Result<T, NetError>> {
        match rv {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) if self.on_network_runner() => {
                let callback = slot(&mut lock(&self.network)).take();
                drop(callback);
                Poll::Ready(result)
            }
            Poll::Ready(result) => {
                self.deliver(slot, result);
                Poll::Pending
            }
        }
    }
}

/// [`RelayPort`] that starts transport I/O inline on the transport domain
/// or posts it there.
struct CorePort<'a>(&'a Arc<Core>);

impl RelayPort for CorePort<'_> {
    fn start_recv(&self, len: usize) -> Poll<Result<Vec<u8>, NetError>> {
        let core = self.0;
        if core.on_network_runner() {
            return core.do_buffer_recv(len);
        }
        let c = Arc::clone(core);
        if core.network_runner.post_task(Box::new(move || {
            let _ = c.do_buffer_recv(len);
        })) {
            Poll::Pending
        } else {
            Poll::Ready(Err(NetError::Aborted))
        }
    }

    fn start_send(&self, data: Vec<u8>) -> Poll<Result<usize, NetError>> {
        let core = self.0;
        if core.on_network_runner() {
            return core.do_buffer_send(data);
        }
        let c = Arc::clone(core);
        if core.network_runner.post_task(Box::new(move || {
            let _ = c.do_buffer_send(data);
        })) {
            Poll::Pending
        } else {
            Poll::Ready(Err(NetError::Aborted))
        }
    }
}
