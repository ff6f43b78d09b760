//! Negotiated handshake parameters, shared between the two domains as
//! immutable snapshots.

use tlsock_types::{ConnectionStatus, EngineError};

use crate::cert::{CertificateChain, ParsedCertificate};
use crate::client_auth::{BoundCertType, ClientCertificate};
use crate::engine::HandshakeSummary;

/// Outcome of next-protocol negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextProtoStatus {
    /// The peer did not take part.
    #[default]
    Unsupported,
    Negotiated,
    /// No protocol in common; our first preference was chosen anyway.
    NoOverlap,
}

/// Parameters negotiated by the current handshake.
///
/// The engine domain mutates its own copy; the transport domain only ever
/// sees whole clones of it.
#[derive(Debug, Clone, Default)]
pub struct HandshakeState {
    pub next_proto_status: NextProtoStatus,
    pub next_proto: Vec<u8>,
    /// The peer's advertised protocols, in its order.
    pub server_protos: Vec<Vec<u8>>,
    /// Type of the origin-bound certificate sent, if one was.
    pub client_cert_type: Option<BoundCertType>,
    /// Candidate client certificates matching the last certificate request.
    pub client_certs: Vec<ClientCertificate>,
    pub server_cert_chain: CertificateChain,
    pub server_cert: Option<ParsedCertificate>,
    pub predicted_chain_matched: bool,
    pub resumed: bool,
    pub connection_status: ConnectionStatus,
}

impl HandshakeState {
    /// Records what the engine reported at handshake completion.
    pub(crate) fn apply_summary(
        &mut self,
        summary: &HandshakeSummary,
        version_fallback: bool,
        predicted_certs: &[Vec<u8>],
    ) {
        self.resumed = summary.resumed;
        self.server_cert_chain
            .reset(summary.peer_certificates.clone());
        self.server_cert = ParsedCertificate::from_chain(&self.server_cert_chain);

        let mut status = ConnectionStatus::default();
        if let Some(channel) = summary.channel {
            status.set_cipher_suite(channel.cipher_suite);
            status.set_compression(channel.compression_method);
            status.set_wire_version(channel.protocol_version);
        }
        if !summary.peer_supports_renegotiation_info {
            status.set(ConnectionStatus::NO_RENEGOTIATION_EXTENSION);
        }
        if version_fallback {
            status.set(ConnectionStatus::VERSION_FALLBACK);
        }
        self.connection_status = status;
        self.predicted_chain_matched = self.server_cert_chain.matches(predicted_certs);
    }
}

/// Largest protocol name the wire format can carry.
pub const MAX_PROTOCOL_LEN: usize = 255;

/// Splits a length-prefixed protocol list. Parsing stops at the first
/// truncated entry.
pub fn parse_protocol_list(wire: &[u8]) -> Vec<Vec<u8>> {
    let mut protos = Vec::new();
    let mut rest = wire;
    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len);
        if len == 0 || tail.len() < len {
            break;
        }
        protos.push(tail[..len].to_vec());
        rest = &tail[len..];
    }
    protos
}

/// Picks a protocol: the first of the peer's protocols we also support, or
/// our own first preference when there is none in common.
pub fn negotiate_next_protocol(
    local: &[Vec<u8>],
    server_wire: &[u8],
) -> Result<(NextProtoStatus, Vec<u8>, Vec<Vec<u8>>), EngineError> {
    let fallback = local.first().ok_or_else(|| {
        EngineError::InvalidArgument("no local protocols configured".into())
    })?;
    let server_protos = parse_protocol_list(server_wire);

    let chosen = server_protos
        .iter()
        .find(|proto| local.contains(proto))
        .map(|proto| (NextProtoStatus::Negotiated, proto.clone()))
        .unwrap_or_else(|| (NextProtoStatus::NoOverlap, fallback.clone()));

    if chosen.1.len() > MAX_PROTOCOL_LEN {
        return Err(EngineError::OutputTooLong);
    }
    Ok((chosen.0, chosen.1, server_protos))
}
