use crate::status::{AlertDescription, CertStatus};
use std::io;

/// A failure reported by the transport socket.
///
/// Kept as plain data so it can be cloned and handed back to the engine
/// every time it asks for bytes after the transport has failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: io::ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Connection-level errors delivered to socket callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("client authentication certificate needed")]
    ClientAuthCertNeeded,
    #[error("client certificate has no usable private key")]
    ClientAuthCertNoPrivateKey,
    #[error("client certificate signature failed")]
    ClientAuthSignatureFailed,
    #[error("peer rejected the client certificate")]
    BadClientAuthCert,
    #[error("server certificate is invalid")]
    CertificateInvalid,
    #[error("certificate verification failed: {reason}")]
    CertVerifyFailed { status: CertStatus, reason: String },
    #[error("public key pin not found in certificate chain")]
    PinnedKeyNotInChain,
    #[error("operation aborted")]
    Aborted,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("no SSL versions enabled")]
    NoSslVersionsEnabled,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl NetError {
    /// Whether this error comes from certificate verification.
    pub fn is_certificate_error(&self) -> bool {
        matches!(
            self,
            NetError::CertificateInvalid
                | NetError::CertVerifyFailed { .. }
                | NetError::PinnedKeyNotInChain
        )
    }

    /// Whether a previously usable client credential stopped working.
    pub fn is_client_credential_failure(&self) -> bool {
        matches!(
            self,
            NetError::ClientAuthCertNoPrivateKey | NetError::ClientAuthSignatureFailed
        )
    }
}

/// Errors raised inside the engine domain.
///
/// These never reach a caller directly; they are mapped to a [`NetError`]
/// with [`map_client_error`] or [`map_client_handshake_error`] first.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("operation would block")]
    WouldBlock,
    #[error("unexpected end of stream")]
    EndOfFile,
    #[error("fatal alert: {0:?}")]
    Alert(AlertDescription),
    #[error("malformed protocol message: {0}")]
    Protocol(String),
    #[error("client certificate private key unavailable")]
    ClientAuthNoPrivateKey,
    #[error("client certificate signature failed")]
    ClientAuthSignatureFailed,
    #[error("no enabled protocol version")]
    UnsupportedVersion,
    #[error("output too long")]
    OutputTooLong,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("i/o: {0}")]
    Io(NetError),
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, EngineError::WouldBlock)
    }
}

/// Maps an engine error seen during a read, write or handshake.
///
/// Returns `None` for [`EngineError::WouldBlock`], which is not an error to
/// the caller but a request to wait for more transport I/O.
pub fn map_client_error(err: EngineError) -> Option<NetError> {
    let mapped = match err {
        EngineError::WouldBlock => return None,
        EngineError::Alert(alert) if alert.rejects_client_certificate() => {
            NetError::BadClientAuthCert
        }
        EngineError::Alert(alert) => NetError::ProtocolError(format!("fatal alert {alert:?}")),
        EngineError::EndOfFile => NetError::ConnectionClosed,
        EngineError::Protocol(msg) => NetError::ProtocolError(msg),
        EngineError::ClientAuthNoPrivateKey => NetError::ClientAuthCertNoPrivateKey,
        EngineError::ClientAuthSignatureFailed => NetError::ClientAuthSignatureFailed,
        EngineError::UnsupportedVersion => NetError::NoSslVersionsEnabled,
        EngineError::OutputTooLong => NetError::InvalidArgument("output too long".into()),
        EngineError::InvalidArgument(msg) => NetError::InvalidArgument(msg),
        EngineError::Io(e) => e,
        EngineError::Internal(msg) => NetError::Unexpected(msg),
    };
    Some(mapped)
}

/// Like [`map_client_error`], but a premature end of stream during the
/// handshake is a protocol error rather than a clean close.
pub fn map_client_handshake_error(err: EngineError) -> Option<NetError> {
    match err {
        EngineError::EndOfFile => Some(NetError::ProtocolError(
            "connection closed during handshake".into(),
        )),
        other => map_client_error(other),
    }
}
