//! Server certificate chains as received from the engine.

use sha2::{Digest, Sha256};
use std::fmt;

/// Ordered DER certificates, leaf first.
///
/// Cloning copies every certificate; the snapshot handed across domains is
/// never shared with the engine's own copy.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CertificateChain {
    certs: Vec<Vec<u8>>,
}

impl CertificateChain {
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        Self { certs }
    }

    /// Replaces the contents with `certs`.
    pub fn reset(&mut self, certs: Vec<Vec<u8>>) {
        self.certs = certs;
    }

    pub fn clear(&mut self) {
        self.certs.clear();
    }

    pub fn leaf(&self) -> Option<&[u8]> {
        self.certs.first().map(Vec::as_slice)
    }

    pub fn certs(&self) -> &[Vec<u8>] {
        &self.certs
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Byte-for-byte comparison against a predicted chain.
    pub fn matches(&self, predicted: &[Vec<u8>]) -> bool {
        !predicted.is_empty() && self.certs.as_slice() == predicted
    }
}

impl fmt::Debug for CertificateChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.certs.iter().map(|c| format!("[{} bytes]", c.len())))
            .finish()
    }
}

/// A chain whose certificates are all well-formed DER structures.
///
/// Only the outer envelope is checked here; path building and field
/// validation belong to the certificate verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    chain: CertificateChain,
}

impl ParsedCertificate {
    pub fn from_chain(chain: &CertificateChain) -> Option<Self> {
        if chain.is_empty() || !chain.certs().iter().all(|c| is_der_sequence(c)) {
            return None;
        }
        Some(Self {
            chain: chain.clone(),
        })
    }

    pub fn chain(&self) -> &CertificateChain {
        &self.chain
    }

    pub fn leaf(&self) -> &[u8] {
        self.chain.leaf().unwrap_or_default()
    }

    /// SPKI hashes of every certificate in the chain, leaf first.
    /// Certificates without a recognizable TBSCertificate are skipped.
    pub fn public_key_hashes(&self) -> Vec<HashValue> {
        self.chain
            .certs()
            .iter()
            .filter_map(|c| subject_public_key_info(c))
            .map(HashValue::sha256)
            .collect()
    }
}

/// Checks for a single definite-length SEQUENCE spanning all of `der`.
fn is_der_sequence(der: &[u8]) -> bool {
    matches!(read_element(der), Some((0x30, _, _, rest)) if rest.is_empty())
}

/// Splits the first DER element off `der`.
///
/// Returns the tag, the whole encoded element, its contents and whatever
/// follows it.
fn read_element(der: &[u8]) -> Option<(u8, &[u8], &[u8], &[u8])> {
    let (&tag, after_tag) = der.split_first()?;
    let (&first, after_len) = after_tag.split_first()?;
    let (len, body) = if first & 0x80 == 0 {
        (usize::from(first), after_len)
    } else {
        let n = usize::from(first & 0x7f);
        if n == 0 || n > 4 || after_len.len() < n {
            return None;
        }
        let (len_bytes, body) = after_len.split_at(n);
        let len = len_bytes
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        (len, body)
    };
    if body.len() < len {
        return None;
    }
    let (contents, rest) = body.split_at(len);
    let element = &der[..der.len() - rest.len()];
    Some((tag, element, contents, rest))
}

/// Locates the encoded SubjectPublicKeyInfo inside an X.509 certificate.
fn subject_public_key_info(cert: &[u8]) -> Option<&[u8]> {
    let (0x30, _, cert_body, _) = read_element(cert)? else {
        return None;
    };
    let (0x30, _, tbs, _) = read_element(cert_body)? else {
        return None;
    };
    let mut fields = tbs;
    if fields.first() == Some(&0xa0) {
        fields = read_element(fields)?.3;
    }
    // serialNumber, signature, issuer, validity, subject
    for _ in 0..5 {
        fields = read_element(fields)?.3;
    }
    match read_element(fields)? {
        (0x30, spki, _, _) => Some(spki),
        _ => None,
    }
}

/// SHA-256 digest of a certificate's SubjectPublicKeyInfo.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashValue(pub [u8; 32]);

impl HashValue {
    pub fn sha256(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256/")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn der(body: &[u8]) -> Vec<u8> {
        let mut out = vec![0x30, body.len() as u8];
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_chain_leaf_and_match() {
        let chain = CertificateChain::new(vec![der(b"leaf"), der(b"ca")]);
        assert_eq!(chain.leaf(), Some(der(b"leaf").as_slice()));
        assert!(chain.matches(&[der(b"leaf"), der(b"ca")]));
        assert!(!chain.matches(&[der(b"leaf")]));
        assert!(!chain.matches(&[]));
        assert!(!CertificateChain::default().matches(&[]));
    }

    #[test]
    fn test_clone_is_deep() {
        let mut chain = CertificateChain::new(vec![der(b"a")]);
        let copy = chain.clone();
        chain.reset(vec![der(b"b")]);
        assert_eq!(copy.leaf(), Some(der(b"a").as_slice()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ParsedCertificate::from_chain(&CertificateChain::default()).is_none());
        let bad = CertificateChain::new(vec![der(b"ok"), b"not der".to_vec()]);
        assert!(ParsedCertificate::from_chain(&bad).is_none());
        let truncated = CertificateChain::new(vec![vec![0x30, 0x05, 1, 2]]);
        assert!(ParsedCertificate::from_chain(&truncated).is_none());
    }

    #[test]
    fn test_parse_long_form_length() {
        let mut long = vec![0x30, 0x81, 200];
        long.extend(std::iter::repeat(7u8).take(200));
        let parsed = ParsedCertificate::from_chain(&CertificateChain::new(vec![long.clone()]));
        assert_eq!(parsed.map(|p| p.leaf().to_vec()), Some(long));
    }

    fn tlv(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag, body.len() as u8];
        out.extend_from_slice(body);
        out
    }

    fn certificate(versioned: bool, spki: &[u8]) -> Vec<u8> {
        let mut tbs = Vec::new();
        if versioned {
            tbs.extend(tlv(0xa0, &tlv(0x02, &[2])));
        }
        tbs.extend(tlv(0x02, &[0x01, 0x23]));
        tbs.extend(der(b"alg"));
        tbs.extend(der(b"issuer"));
        tbs.extend(der(b"validity"));
        tbs.extend(der(b"subject"));
        tbs.extend_from_slice(spki);
        let mut body = der(&tbs);
        body.extend(der(b"sigalg"));
        body.extend(tlv(0x03, &[0, 0xff]));
        der(&body)
    }

    #[test]
    fn test_public_key_hashes_cover_spki() {
        let leaf_key = der(b"leaf-key");
        let ca_key = der(b"ca-key");
        let chain = CertificateChain::new(vec![certificate(true, &leaf_key), certificate(false, &ca_key)]);
        let parsed = ParsedCertificate::from_chain(&chain).unwrap();
        assert_eq!(
            parsed.public_key_hashes(),
            vec![HashValue::sha256(&leaf_key), HashValue::sha256(&ca_key)]
        );
    }

    #[test]
    fn test_public_key_hashes_skip_unstructured_certs() {
        let key = der(b"key");
        let chain = CertificateChain::new(vec![der(b"opaque"), certificate(true, &key)]);
        let parsed = ParsedCertificate::from_chain(&chain).unwrap();
        assert_eq!(parsed.public_key_hashes(), vec![HashValue::sha256(&key)]);

        // The field after the subject must itself be a SEQUENCE.
        let not_spki = tlv(0x04, b"key");
        let chain = CertificateChain::new(vec![certificate(false, &not_spki)]);
        assert!(ParsedCertificate::from_chain(&chain).unwrap().public_key_hashes().is_empty());
    }

    #[test]
    fn test_hash_value_sha256() {
        let h = HashValue::sha256(b"abc");
        assert_eq!(h.0[0], 0xba);
        assert_eq!(h.0[31], 0xad);
    }
}
