//! Connection configuration with builder pattern.

use std::fmt;
use std::net::SocketAddr;

use tlsock_types::{CertStatus, CipherSuite, ProtocolVersion};

use crate::client_auth::ClientCertificate;
use crate::HostPortPair;

/// A server certificate the user chose to accept despite verification errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedBadCert {
    /// DER of the leaf certificate.
    pub der: Vec<u8>,
    /// Status to report instead of verifying.
    pub cert_status: CertStatus,
}

/// Settings for one connection attempt. Immutable once built.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub version_min: ProtocolVersion,
    pub version_max: ProtocolVersion,
    pub disabled_cipher_suites: Vec<CipherSuite>,
    /// Application protocols in preference order.
    pub next_protos: Vec<Vec<u8>>,
    /// Whether the client certificate decision has been made. When `true`,
    /// `client_cert` is sent if present and no certificate is sent otherwise.
    pub send_client_cert: bool,
    pub client_cert: Option<ClientCertificate>,
    pub false_start: bool,
    pub session_tickets: bool,
    pub deflate: bool,
    pub cached_info: bool,
    pub bound_certs: bool,
    pub ocsp_stapling: bool,
    /// Set when this attempt is a retry at a lower maximum version.
    pub version_fallback: bool,
    pub rev_checking: bool,
    pub verify_ev_cert: bool,
    pub pin_enforcement: bool,
    pub allowed_bad_certs: Vec<AllowedBadCert>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("version_min", &self.version_min)
            .field("version_max", &self.version_max)
            .field("disabled_cipher_suites", &self.disabled_cipher_suites)
            .field("send_client_cert", &self.send_client_cert)
            .field(
                "client_cert",
                &self.client_cert.as_ref().map(|c| format!("[{} bytes]", c.der.len())),
            )
            .field("bound_certs", &self.bound_certs)
            .field("version_fallback", &self.version_fallback)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// Create a builder for connection configuration.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Whether the ServerNameIndication extension will be sent.
    pub fn sni_available(&self) -> bool {
        self.version_max >= ProtocolVersion::Tls10 || self.version_fallback
    }

    /// Status for a leaf the user has already accepted, if any.
    pub fn allowed_bad_cert_status(&self, leaf: &[u8]) -> Option<CertStatus> {
        self.allowed_bad_certs
            .iter()
            .find(|c| c.der == leaf)
            .map(|c| c.cert_status)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfigBuilder::default().build()
    }
}

/// Builder for `ConnectionConfig`.
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self {
            config: ConnectionConfig {
                version_min: ProtocolVersion::Tls10,
                version_max: ProtocolVersion::Tls12,
                disabled_cipher_suites: Vec::new(),
                next_protos: Vec::new(),
                send_client_cert: false,
                client_cert: None,
                false_start: true,
                session_tickets: true,
                deflate: false,
                cached_info: false,
                bound_certs: false,
                ocsp_stapling: true,
                version_fallback: false,
                rev_checking: true,
                verify_ev_cert: false,
                pin_enforcement: true,
                allowed_bad_certs: Vec::new(),
            },
        }
    }
}

impl fmt::Debug for ConnectionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ConnectionConfigBuilder {
    pub fn version_min(mut self, version: ProtocolVersion) -> Self {
        self.config.version_min = version;
        self
    }

    pub fn version_max(mut self, version: ProtocolVersion) -> Self {
        self.config.version_max = version;
        self
    }

    pub fn disabled_cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.config.disabled_cipher_suites = suites.to_vec();
        self
    }

    pub fn next_protos(mut self, protos: &[&[u8]]) -> Self {
        self.config.next_protos = protos.iter().map(|p| p.to_vec()).collect();
        self
    }

    /// Sends `cert` (or no certificate when `None`) if the server asks.
    pub fn client_cert(mut self, cert: Option<ClientCertificate>) -> Self {
        self.config.send_client_cert = true;
        self.config.client_cert = cert;
        self
    }

    pub fn false_start(mut self, enabled: bool) -> Self {
        self.config.false_start = enabled;
        self
    }

    pub fn session_tickets(mut self, enabled: bool) -> Self {
        self.config.session_tickets = enabled;
        self
    }

    pub fn deflate(mut self, enabled: bool) -> Self {
        self.config.deflate = enabled;
        self
    }

    pub fn cached_info(mut self, enabled: bool) -> Self {
        self.config.cached_info = enabled;
        self
    }

    pub fn bound_certs(mut self, enabled: bool) -> Self {
        self.config.bound_certs = enabled;
        self
    }

    pub fn ocsp_stapling(mut self, enabled: bool) -> Self {
        self.config.ocsp_stapling = enabled;
        self
    }

    pub fn version_fallback(mut self, enabled: bool) -> Self {
        self.config.version_fallback = enabled;
        self
    }

    pub fn rev_checking(mut self, enabled: bool) -> Self {
        self.config.rev_checking = enabled;
        self
    }

    pub fn verify_ev_cert(mut self, enabled: bool) -> Self {
        self.config.verify_ev_cert = enabled;
        self
    }

    pub fn pin_enforcement(mut self, enabled: bool) -> Self {
        self.config.pin_enforcement = enabled;
        self
    }

    pub fn allow_bad_cert(mut self, der: Vec<u8>, cert_status: CertStatus) -> Self {
        self.config
            .allowed_bad_certs
            .push(AllowedBadCert { der, cert_status });
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

// ---------------------------------------------------------------------------
// Engine settings
// ---------------------------------------------------------------------------

/// Renegotiation policy handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenegotiationMode {
    Never,
    /// Renegotiate with any server, requiring the renegotiation_info
    /// extension only from servers that sent it in the first handshake.
    Transitional,
    RequireSafe,
}

/// Everything the engine needs to know before the first handshake.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// ServerNameIndication host.
    pub server_name: String,
    /// Session cache key, `host:port[/shard]`.
    pub peer_id: String,
    pub peer_address: Option<SocketAddr>,
    pub version_min: ProtocolVersion,
    pub version_max: ProtocolVersion,
    pub disabled_cipher_suites: Vec<CipherSuite>,
    pub session_tickets: bool,
    pub deflate: bool,
    pub false_start: bool,
    pub cbc_random_iv: bool,
    pub ocsp_stapling: bool,
    pub cached_info: bool,
    pub bound_certs: bool,
    pub encrypt_client_certs: bool,
    pub next_protos: Vec<Vec<u8>>,
    pub renegotiation: RenegotiationMode,
}

impl EngineSettings {
    pub fn new(
        config: &ConnectionConfig,
        host_and_port: &HostPortPair,
        peer_id: String,
        peer_address: Option<SocketAddr>,
    ) -> Self {
        Self {
            server_name: host_and_port.host.clone(),
            peer_id,
            peer_address,
            version_min: config.version_min,
            version_max: config.version_max,
            disabled_cipher_suites: config.disabled_cipher_suites.clone(),
            session_tickets: config.session_tickets,
            // Compression only exists from TLS 1.0 on.
            deflate: config.deflate && config.version_max >= ProtocolVersion::Tls10,
            false_start: config.false_start,
            cbc_random_iv: config.false_start,
            ocsp_stapling: config.ocsp_stapling,
            cached_info: config.cached_info,
            bound_certs: config.bound_certs,
            encrypt_client_certs: config.bound_certs,
            next_protos: config.next_protos.clone(),
            renegotiation: RenegotiationMode::Transitional,
        }
    }
}
