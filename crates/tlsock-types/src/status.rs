//! Protocol identifiers and the packed status words reported per connection.

use std::fmt;

/// SSL/TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    Ssl3,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl ProtocolVersion {
    /// The two-byte version as it appears on the wire.
    pub fn wire_version(self) -> u16 {
        match self {
            ProtocolVersion::Ssl3 => 0x0300,
            ProtocolVersion::Tls10 => 0x0301,
            ProtocolVersion::Tls11 => 0x0302,
            ProtocolVersion::Tls12 => 0x0303,
            ProtocolVersion::Tls13 => 0x0304,
        }
    }

    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            0x0300 => Some(ProtocolVersion::Ssl3),
            0x0301 => Some(ProtocolVersion::Tls10),
            0x0302 => Some(ProtocolVersion::Tls11),
            0x0303 => Some(ProtocolVersion::Tls12),
            0x0304 => Some(ProtocolVersion::Tls13),
            _ => None,
        }
    }
}

/// TLS cipher suite identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CipherSuite(pub u16);

impl CipherSuite {
    pub const TLS_RSA_WITH_RC4_128_SHA: Self = Self(0x0005);
    pub const TLS_RSA_WITH_AES_128_CBC_SHA: Self = Self(0x002F);
    pub const TLS_RSA_WITH_AES_256_CBC_SHA: Self = Self(0x0035);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02B);
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02F);
    pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0xC030);
    pub const TLS_AES_128_GCM_SHA256: Self = Self(0x1301);
}

/// Alert descriptions an engine may surface as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    HandshakeFailure = 40,
    BadCertificate = 42,
    UnsupportedCertificate = 43,
    CertificateRevoked = 44,
    CertificateExpired = 45,
    CertificateUnknown = 46,
    IllegalParameter = 47,
    UnknownCa = 48,
    AccessDenied = 49,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    UserCanceled = 90,
    NoRenegotiation = 100,
    UnsupportedExtension = 110,
}

impl AlertDescription {
    /// Alerts a server sends when it refuses the client certificate we offered.
    pub fn rejects_client_certificate(self) -> bool {
        matches!(
            self,
            AlertDescription::BadCertificate
                | AlertDescription::UnsupportedCertificate
                | AlertDescription::CertificateRevoked
                | AlertDescription::CertificateExpired
                | AlertDescription::CertificateUnknown
                | AlertDescription::UnknownCa
                | AlertDescription::AccessDenied
        )
    }
}

// ---------------------------------------------------------------------------
// Connection status word
// ---------------------------------------------------------------------------

/// Version codes stored in bits 20..23 of [`ConnectionStatus`].
pub mod version_code {
    pub const UNKNOWN: u32 = 0;
    pub const SSL2: u32 = 1;
    pub const SSL3: u32 = 2;
    pub const TLS1: u32 = 3;
    pub const TLS1_1: u32 = 4;
    pub const TLS1_2: u32 = 5;
    pub const TLS1_3: u32 = 6;
}

/// Packed per-connection status: cipher suite, compression, flags, version.
///
/// Layout: bits 0-15 cipher suite, 16-17 compression method, bit 18 "peer
/// lacks the renegotiation extension", bit 19 "version fallback was used",
/// bits 20-22 protocol version code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionStatus(pub u32);

impl ConnectionStatus {
    pub const CIPHER_SUITE_MASK: u32 = 0xffff;
    pub const COMPRESSION_SHIFT: u32 = 16;
    pub const COMPRESSION_MASK: u32 = 3;
    pub const NO_RENEGOTIATION_EXTENSION: u32 = 1 << 18;
    pub const VERSION_FALLBACK: u32 = 1 << 19;
    pub const VERSION_SHIFT: u32 = 20;
    pub const VERSION_MASK: u32 = 7;

    pub fn cipher_suite(self) -> CipherSuite {
        CipherSuite((self.0 & Self::CIPHER_SUITE_MASK) as u16)
    }

    pub fn set_cipher_suite(&mut self, suite: CipherSuite) {
        self.0 = (self.0 & !Self::CIPHER_SUITE_MASK) | u32::from(suite.0);
    }

    pub fn compression(self) -> u8 {
        ((self.0 >> Self::COMPRESSION_SHIFT) & Self::COMPRESSION_MASK) as u8
    }

    pub fn set_compression(&mut self, method: u8) {
        self.0 &= !(Self::COMPRESSION_MASK << Self::COMPRESSION_SHIFT);
        self.0 |= (u32::from(method) & Self::COMPRESSION_MASK) << Self::COMPRESSION_SHIFT;
    }

    /// Version code, see [`version_code`].
    pub fn version_code(self) -> u32 {
        (self.0 >> Self::VERSION_SHIFT) & Self::VERSION_MASK
    }

    pub fn protocol_version(self) -> Option<ProtocolVersion> {
        match self.version_code() {
            version_code::SSL3 => Some(ProtocolVersion::Ssl3),
            version_code::TLS1 => Some(ProtocolVersion::Tls10),
            version_code::TLS1_1 => Some(ProtocolVersion::Tls11),
            version_code::TLS1_2 => Some(ProtocolVersion::Tls12),
            version_code::TLS1_3 => Some(ProtocolVersion::Tls13),
            _ => None,
        }
    }

    /// Records the negotiated wire version. Anything below SSL 3.0 counts as
    /// SSL 2; anything unrecognised above it as unknown.
    pub fn set_wire_version(&mut self, wire: u16) {
        let code = if wire < 0x0300 {
            version_code::SSL2
        } else {
            match ProtocolVersion::from_wire(wire) {
                Some(ProtocolVersion::Ssl3) => version_code::SSL3,
                Some(ProtocolVersion::Tls10) => version_code::TLS1,
                Some(ProtocolVersion::Tls11) => version_code::TLS1_1,
                Some(ProtocolVersion::Tls12) => version_code::TLS1_2,
                Some(ProtocolVersion::Tls13) => version_code::TLS1_3,
                None => version_code::UNKNOWN,
            }
        };
        self.0 &= !(Self::VERSION_MASK << Self::VERSION_SHIFT);
        self.0 |= code << Self::VERSION_SHIFT;
    }

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }
}

impl fmt::Debug for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStatus")
            .field("cipher_suite", &format_args!("{:#06x}", self.cipher_suite().0))
            .field("compression", &self.compression())
            .field("version_code", &self.version_code())
            .field(
                "no_renegotiation_extension",
                &self.has(Self::NO_RENEGOTIATION_EXTENSION),
            )
            .field("version_fallback", &self.has(Self::VERSION_FALLBACK))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Certificate status word
// ---------------------------------------------------------------------------

/// Certificate status bits produced by verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CertStatus(pub u32);

impl CertStatus {
    pub const COMMON_NAME_INVALID: u32 = 1 << 0;
    pub const DATE_INVALID: u32 = 1 << 1;
    pub const AUTHORITY_INVALID: u32 = 1 << 2;
    pub const NO_REVOCATION_MECHANISM: u32 = 1 << 4;
    pub const UNABLE_TO_CHECK_REVOCATION: u32 = 1 << 5;
    pub const REVOKED: u32 = 1 << 6;
    pub const INVALID: u32 = 1 << 7;
    pub const WEAK_KEY: u32 = 1 << 11;
    pub const IS_EV: u32 = 1 << 16;
    pub const REV_CHECKING_ENABLED: u32 = 1 << 17;
    pub const IS_DNSSEC: u32 = 1 << 18;

    const ALL_ERRORS: u32 = 0xffff;
    const MINOR_ERRORS: u32 = Self::NO_REVOCATION_MECHANISM | Self::UNABLE_TO_CHECK_REVOCATION;

    pub fn has(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ALL_ERRORS != 0
    }

    /// True when every error bit set is one that does not invalidate the
    /// certificate (revocation information simply being unavailable).
    pub fn is_minor_error(self) -> bool {
        let errors = self.0 & Self::ALL_ERRORS;
        errors != 0 && errors & !Self::MINOR_ERRORS == 0
    }
}
