//! Socket events and where they go.

use tlsock_types::NetError;

/// A notable step in the life of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    ConnectBegin,
    ConnectEnd { result: Result<(), NetError> },
    ClientCertRequested,
    /// `cert_count` is `None` when the engine builds the chain itself.
    ClientCertProvided { cert_count: Option<usize> },
    HandshakeError { error: NetError },
    ReadError { error: NetError },
    WriteError { error: NetError },
    BytesReceived { len: usize },
    BytesSent { len: usize },
    CertificatesReceived { count: usize },
    BoundCertFetchBegin { origin: String },
    BoundCertFetchEnd { result: Result<(), NetError> },
    /// Verification was satisfied by the one started for the predicted chain.
    VerificationMerged,
    PublicKeyPinCheck { host: String, permitted: bool, enforced: bool },
}

/// Receives socket events on the transport domain.
pub trait EventSink: Send + Sync {
    fn add_event(&self, event: &SocketEvent);
}

/// Writes events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn add_event(&self, event: &SocketEvent) {
        match event {
            SocketEvent::HandshakeError { error }
            | SocketEvent::ReadError { error }
            | SocketEvent::WriteError { error } => log::debug!("ssl error: {error}"),
            SocketEvent::PublicKeyPinCheck {
                host,
                permitted: false,
                enforced,
            } => log::warn!("public key pin mismatch for {host} (enforced: {enforced})"),
            SocketEvent::BytesReceived { .. } | SocketEvent::BytesSent { .. } => {
                log::trace!("{event:?}")
            }
            _ => log::debug!("{event:?}"),
        }
    }
}
