//! Client authentication: choosing what to answer a CertificateRequest with.
//!
//! Three sources exist. A certificate the caller already chose, an
//! origin-bound certificate fetched from a [`BoundCertService`], or the
//! user's certificate store, whose matching entries are reported back so the
//! caller can pick one and reconnect.

use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;

use tlsock_types::NetError;

use crate::config::ConnectionConfig;
use crate::engine::{ClientAuthRequest, ClientCredential, KeyKind, PrivateKey};
use crate::runner::lock;
use crate::{CompletionCallback, HostPortPair};

/// A client certificate known to the local store.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub der: Vec<u8>,
    pub intermediates: Vec<Vec<u8>>,
    /// DER issuer names along the chain, leaf's issuer first.
    pub issuers: Vec<Vec<u8>>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl ClientCertificate {
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whether any issuer in the chain is acceptable. An empty list accepts
    /// everything.
    pub fn issued_by_any(&self, ca_names: &[Vec<u8>]) -> bool {
        ca_names.is_empty() || self.issuers.iter().any(|issuer| ca_names.contains(issuer))
    }
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("der", &format_args!("[{} bytes]", self.der.len()))
            .field("intermediates", &self.intermediates.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Platform certificate store.
pub trait ClientCertStore: Send + Sync {
    /// All certificates the user could authenticate with.
    fn user_certificates(&self) -> Vec<ClientCertificate>;

    /// Loads the private key for `cert`, if the store can reach it.
    fn find_private_key(&self, cert: &ClientCertificate) -> Option<PrivateKey>;

    /// Forgets any cached key handle for `cert` after it stopped working.
    fn invalidate_cached_key(&self, _cert: &ClientCertificate) {}
}

/// A [`ClientCertStore`] backed by a list held in memory.
#[derive(Default)]
pub struct InMemoryCertStore {
    entries: Mutex<Vec<(ClientCertificate, Option<PrivateKey>)>>,
}

impl InMemoryCertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, cert: ClientCertificate, key: Option<PrivateKey>) {
        lock(&self.entries).push((cert, key));
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl ClientCertStore for InMemoryCertStore {
    fn user_certificates(&self) -> Vec<ClientCertificate> {
        lock(&self.entries).iter().map(|(c, _)| c.clone()).collect()
    }

    fn find_private_key(&self, cert: &ClientCertificate) -> Option<PrivateKey> {
        lock(&self.entries)
            .iter()
            .find(|(c, _)| c.der == cert.der)
            .and_then(|(_, key)| key.clone())
    }

    fn invalidate_cached_key(&self, cert: &ClientCertificate) {
        for (c, key) in lock(&self.entries).iter_mut() {
            if c.der == cert.der {
                *key = None;
            }
        }
    }
}

/// What to do about a CertificateRequest that does not involve a bound
/// certificate.
#[derive(Debug)]
pub enum ClientAuthOutcome {
    Provide(ClientCredential),
    NoCertificate,
    /// No decision yet; these certificates match the request.
    Candidates(Vec<ClientCertificate>),
}

/// Decides how to answer `request` from the configuration and the store.
pub fn negotiate(
    config: &ConnectionConfig,
    store: &dyn ClientCertStore,
    request: &ClientAuthRequest,
    now: SystemTime,
) -> ClientAuthOutcome {
    if config.send_client_cert {
        let Some(cert) = &config.client_cert else {
            return ClientAuthOutcome::NoCertificate;
        };
        return match store.find_private_key(cert) {
            Some(private_key) => {
                let mut chain = Vec::with_capacity(1 + cert.intermediates.len());
                chain.push(cert.der.clone());
                chain.extend(cert.intermediates.iter().cloned());
                let cert_count = if cert.intermediates.is_empty() {
                    None
                } else {
                    Some(chain.len())
                };
                ClientAuthOutcome::Provide(ClientCredential {
                    chain,
                    private_key,
                    cert_count,
                })
            }
            None => {
                log::warn!("no private key for the configured client certificate");
                ClientAuthOutcome::NoCertificate
            }
        };
    }

    let candidates = store
        .user_certificates()
        .into_iter()
        .filter(|c| c.is_valid_at(now) && c.issued_by_any(&request.ca_names))
        .collect();
    ClientAuthOutcome::Candidates(candidates)
}

// ---------------------------------------------------------------------------
// Origin-bound certificates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundCertType {
    RsaSign,
    EcdsaSign,
}

impl BoundCertType {
    /// ClientCertificateType code.
    pub fn code(self) -> u8 {
        match self {
            BoundCertType::RsaSign => 1,
            BoundCertType::EcdsaSign => 64,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(BoundCertType::RsaSign),
            64 => Some(BoundCertType::EcdsaSign),
            _ => None,
        }
    }
}

/// A certificate and key bound to one origin.
#[derive(Debug, Clone)]
pub struct BoundCert {
    pub cert_type: BoundCertType,
    pub cert: Vec<u8>,
    /// Encrypted PKCS#8 private key.
    pub private_key: PrivateKey,
}

/// Identifies an outstanding [`BoundCertService`] request.
pub type RequestHandle = u64;

pub enum BoundCertRequest {
    Ready(Result<BoundCert, NetError>),
    Pending(RequestHandle),
}

/// Source of origin-bound certificates. Lives on the transport domain.
pub trait BoundCertService: Send + Sync {
    /// Looks up or creates the certificate for `origin`.
    ///
    /// On `Pending` the callback fires later on the transport domain unless
    /// the request is cancelled first.
    fn get_bound_cert(
        &self,
        origin: &str,
        requested_types: &[u8],
        callback: CompletionCallback<BoundCert>,
    ) -> BoundCertRequest;

    fn cancel_request(&self, handle: RequestHandle);
}

/// Origin string bound certificates are keyed by.
pub fn bound_cert_origin(host_and_port: &HostPortPair) -> String {
    format!("https://{host_and_port}")
}

/// Turns a fetched bound certificate into a credential for the engine.
/// Only ECDSA certificates are supported.
pub fn import_bound_cert(bound: &BoundCert) -> Result<ClientCredential, NetError> {
    if bound.cert_type != BoundCertType::EcdsaSign {
        return Err(NetError::InvalidArgument(format!(
            "unsupported bound certificate type {:?}",
            bound.cert_type
        )));
    }
    if bound.cert.is_empty() || bound.private_key.der().is_empty() {
        return Err(NetError::InvalidArgument("empty bound certificate".into()));
    }
    if bound.private_key.kind() != KeyKind::EncryptedPkcs8 {
        return Err(NetError::InvalidArgument(
            "bound certificate key is not encrypted PKCS#8".into(),
        ));
    }
    Ok(ClientCredential {
        chain: vec![bound.cert.clone()],
        private_key: bound.private_key.clone(),
        cert_count: Some(1),
    })
}
