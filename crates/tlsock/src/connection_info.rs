//! Connection information snapshots.
//!
//! After the handshake and certificate verification complete, callers can
//! query negotiated parameters via the [`ConnectionInfo`] struct returned by
//! `SslClientSocket::get_connection_info()`.

use tlsock_types::{CertStatus, CipherSuite, ConnectionStatus, ProtocolVersion};

use crate::cert::{HashValue, ParsedCertificate};
use crate::client_auth::{BoundCertType, ClientCertificate};
use crate::handshake_state::NextProtoStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeType {
    #[default]
    Full,
    Resumed,
}

/// Snapshot of negotiated connection parameters after handshake.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// The negotiated cipher suite.
    pub cipher_suite: CipherSuite,
    /// Negotiated version, if the engine reported a known one.
    pub protocol_version: Option<ProtocolVersion>,
    pub compression: u8,
    /// The full packed status word.
    pub connection_status: ConnectionStatus,
    /// The verified server certificate chain.
    pub cert: Option<ParsedCertificate>,
    pub cert_status: CertStatus,
    pub public_key_hashes: Vec<HashValue>,
    pub is_issued_by_known_root: bool,
    /// A pin mismatch was seen but not enforced.
    pub pin_override_active: bool,
    pub client_cert_sent: bool,
    pub bound_cert_type: Option<BoundCertType>,
    pub handshake_type: HandshakeType,
}

/// Why the server asked for a client certificate, and what could answer it.
#[derive(Debug, Clone, Default)]
pub struct CertRequestInfo {
    pub host_and_port: String,
    pub client_certs: Vec<ClientCertificate>,
}

/// Result of next-protocol negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedProtocol {
    pub status: NextProtoStatus,
    pub protocol: Vec<u8>,
    /// The peer's advertised list, in its order.
    pub server_protos: Vec<Vec<u8>>,
}
