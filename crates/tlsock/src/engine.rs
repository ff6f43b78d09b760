//! The opaque TLS engine and the hooks it calls back into mid-handshake.
//!
//! The engine implements the record and handshake byte protocol. It only
//! ever runs on the engine domain and does its I/O through a [`MemoryBio`].

use std::fmt;

use tlsock_types::{CipherSuite, EngineError, NetError};
use zeroize::Zeroize;

use crate::bio::MemoryBio;
use crate::config::EngineSettings;

/// What the peer asked for in its CertificateRequest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAuthRequest {
    /// Acceptable certificate types, as the raw type codes.
    pub cert_types: Vec<u8>,
    /// DER-encoded distinguished names of acceptable issuers.
    pub ca_names: Vec<Vec<u8>>,
    /// Whether the origin-bound certificate extension was negotiated.
    pub bound_cert_negotiated: bool,
}

/// Answer to a client authentication request.
#[derive(Debug)]
pub enum ClientAuthDecision {
    /// Continue the handshake with this credential.
    Provide(ClientCredential),
    /// Continue without a client certificate.
    NoCertificate,
    /// Stop here; the engine reports `WouldBlock` until
    /// [`Engine::restart_after_cert_request`] is called or the attempt is
    /// abandoned.
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ecdsa,
    /// Encrypted PKCS#8, as handed out by the bound certificate service.
    EncryptedPkcs8,
}

/// Private key material. Wiped on drop.
#[derive(Clone)]
pub struct PrivateKey {
    kind: KeyKind,
    der: Vec<u8>,
}

impl PrivateKey {
    pub fn new(kind: KeyKind, der: Vec<u8>) -> Self {
        Self { kind, der }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.der.zeroize();
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("kind", &self.kind)
            .field("der", &format_args!("[{} bytes]", self.der.len()))
            .finish()
    }
}

/// A client certificate with its key, ready for the engine.
#[derive(Debug, Clone)]
pub struct ClientCredential {
    /// DER certificates, leaf first.
    pub chain: Vec<Vec<u8>>,
    pub private_key: PrivateKey,
    /// How many certificates will be sent. `None` when the engine builds the
    /// chain itself from the leaf.
    pub cert_count: Option<usize>,
}

/// Negotiated channel parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Wire protocol version, e.g. `0x0303`.
    pub protocol_version: u16,
    pub cipher_suite: CipherSuite,
    pub compression_method: u8,
}

/// Passed to [`EngineHooks::handshake_completed`].
#[derive(Debug, Clone, Default)]
pub struct HandshakeSummary {
    pub resumed: bool,
    /// Server certificates, leaf first.
    pub peer_certificates: Vec<Vec<u8>>,
    pub channel: Option<ChannelInfo>,
    pub peer_supports_renegotiation_info: bool,
}

/// Synchronous callbacks an engine makes while it runs.
pub trait EngineHooks {
    fn client_auth_requested(&mut self, request: &ClientAuthRequest) -> ClientAuthDecision;

    /// Chooses a protocol from the peer's length-prefixed list.
    fn select_next_protocol(&mut self, server_protos: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Called once per completed handshake, including renegotiations.
    fn handshake_completed(&mut self, summary: &HandshakeSummary);
}

/// A TLS client engine instance for one connection attempt.
///
/// Every method returning [`EngineError::WouldBlock`] expects to be called
/// again once more transport I/O has happened.
pub trait Engine: Send {
    fn configure(&mut self, settings: &EngineSettings) -> Result<(), EngineError>;

    /// Advances the handshake as far as buffered data allows.
    fn handshake(
        &mut self,
        bio: &mut MemoryBio,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), EngineError>;

    /// Reads application data. `Ok(0)` is a clean close.
    ///
    /// Renegotiation requested by the peer is handled inside this call.
    fn read(
        &mut self,
        bio: &mut MemoryBio,
        hooks: &mut dyn EngineHooks,
        buf: &mut [u8],
    ) -> Result<usize, EngineError>;

    fn write(
        &mut self,
        bio: &mut MemoryBio,
        hooks: &mut dyn EngineHooks,
        data: &[u8],
    ) -> Result<usize, EngineError>;

    /// Resumes a handshake suspended by [`ClientAuthDecision::Suspend`].
    fn restart_after_cert_request(
        &mut self,
        credential: Option<ClientCredential>,
    ) -> Result<(), EngineError>;

    /// Drops the session from the session cache so it is not resumed.
    fn invalidate_session(&mut self) -> Result<(), EngineError>;

    /// OCSP response stapled by the server in the last handshake.
    fn stapled_ocsp_response(&self) -> Option<Vec<u8>> {
        None
    }

    fn export_keying_material(
        &mut self,
        label: &str,
        context: Option<&[u8]>,
        out_len: usize,
    ) -> Result<Vec<u8>, EngineError>;
}

/// Creates one engine per connection attempt.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Engine>, NetError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn Engine>, NetError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Engine>, NetError> {
        self()
    }
}
