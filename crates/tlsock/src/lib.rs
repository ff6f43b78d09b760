#![forbid(unsafe_code)]
#![doc = "TLS client socket: drives an opaque TLS engine over an asynchronous transport."]

pub mod bio;
pub mod cert;
pub mod cert_verify;
pub mod client_auth;
pub mod config;
pub mod connection_info;
pub mod engine;
pub mod events;
pub mod export;
pub mod handshake_state;
pub mod pins;
pub mod relay;
pub mod runner;
pub mod session;
pub mod socket;
pub mod socket_core;
pub mod transport;

use std::fmt;

pub use tlsock_types::{
    AlertDescription, CertStatus, CipherSuite, ConnectionStatus, EngineError, NetError,
    ProtocolVersion, TransportError,
};

pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use socket::{ClientSocketContext, SslClientSocket};
pub use socket_core::Core;

/// Single-shot completion callback for an asynchronous operation.
///
/// Invoked at most once, on the transport domain, and never with a pending
/// result.
pub type CompletionCallback<T> = Box<dyn FnOnce(Result<T, NetError>) + Send + 'static>;

/// Host name and port of the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPortPair {
    pub host: String,
    pub port: u16,
}

impl HostPortPair {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
