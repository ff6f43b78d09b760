//! Keying material exporter label checks (RFC 5705).

use tlsock_types::NetError;

/// Labels used by TLS itself, which must not be exported (RFC 5705 §4).
const RESERVED_LABELS: &[&str] = &[
    "client finished",
    "server finished",
    "master secret",
    "extended master secret",
    "key expansion",
];

/// Validate that a label is not reserved.
pub fn validate_exporter_label(label: &str) -> Result<(), NetError> {
    if RESERVED_LABELS.contains(&label) {
        return Err(NetError::InvalidArgument(format!(
            "reserved label for key export: {label}"
        )));
    }
    Ok(())
}
