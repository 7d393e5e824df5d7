//! Certificate validation error kinds
//!
//! The kinds form a closed set with stable numeric codes. The codes are what
//! gets persisted in trust rules and published in session metadata, so they
//! must never be renumbered.

use std::fmt;

/// Kind of certificate validation problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CertErrorKind {
    UnknownError,
    InvalidCertificateAuthorityCertificate,
    InvalidCertificate,
    CertificateSignatureFailed,
    SelfSignedCertificate,
    ExpiredCertificate,
    RevokedCertificate,
    InvalidCertificatePurpose,
    RejectedCertificate,
    UntrustedCertificate,
    NoPeerCertificate,
    HostNameMismatch,
    PathLengthExceeded,
}

impl CertErrorKind {
    pub const ALL: [CertErrorKind; 13] = [
        CertErrorKind::UnknownError,
        CertErrorKind::InvalidCertificateAuthorityCertificate,
        CertErrorKind::InvalidCertificate,
        CertErrorKind::CertificateSignatureFailed,
        CertErrorKind::SelfSignedCertificate,
        CertErrorKind::ExpiredCertificate,
        CertErrorKind::RevokedCertificate,
        CertErrorKind::InvalidCertificatePurpose,
        CertErrorKind::RejectedCertificate,
        CertErrorKind::UntrustedCertificate,
        CertErrorKind::NoPeerCertificate,
        CertErrorKind::HostNameMismatch,
        CertErrorKind::PathLengthExceeded,
    ];

    /// Stable numeric code
    pub fn code(self) -> u8 {
        match self {
            CertErrorKind::UnknownError => 1,
            CertErrorKind::InvalidCertificateAuthorityCertificate => 2,
            CertErrorKind::InvalidCertificate => 3,
            CertErrorKind::CertificateSignatureFailed => 4,
            CertErrorKind::SelfSignedCertificate => 5,
            CertErrorKind::ExpiredCertificate => 6,
            CertErrorKind::RevokedCertificate => 7,
            CertErrorKind::InvalidCertificatePurpose => 8,
            CertErrorKind::RejectedCertificate => 9,
            CertErrorKind::UntrustedCertificate => 10,
            CertErrorKind::NoPeerCertificate => 11,
            CertErrorKind::HostNameMismatch => 12,
            CertErrorKind::PathLengthExceeded => 13,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    /// Fatal kinds can never be overridden, neither by a rule nor by the user
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            CertErrorKind::UnknownError
                | CertErrorKind::RevokedCertificate
                | CertErrorKind::RejectedCertificate
                | CertErrorKind::NoPeerCertificate
        )
    }

    /// Map an OpenSSL `X509_V_ERR_*` code
    pub fn from_openssl(raw: i32) -> Self {
        match raw {
            // unable to get issuer cert (locally), unable to verify leaf signature
            2 | 20 | 21 => CertErrorKind::UntrustedCertificate,
            // unable to get / decrypt / validate CRL
            3 | 5 | 8 | 11 | 12 | 15 | 16 => CertErrorKind::InvalidCertificate,
            4 | 7 => CertErrorKind::CertificateSignatureFailed,
            6 | 24 => CertErrorKind::InvalidCertificateAuthorityCertificate,
            // not yet valid, malformed validity fields
            9 | 13 | 14 => CertErrorKind::InvalidCertificate,
            10 => CertErrorKind::ExpiredCertificate,
            18 | 19 => CertErrorKind::SelfSignedCertificate,
            22 | 25 => CertErrorKind::PathLengthExceeded,
            23 => CertErrorKind::RevokedCertificate,
            26 => CertErrorKind::InvalidCertificatePurpose,
            27 => CertErrorKind::UntrustedCertificate,
            28 => CertErrorKind::RejectedCertificate,
            62 | 64 => CertErrorKind::HostNameMismatch,
            _ => CertErrorKind::UnknownError,
        }
    }

    /// Human-readable description
    pub fn description(self) -> &'static str {
        match self {
            CertErrorKind::UnknownError => "An unknown error occurred while validating the certificate",
            CertErrorKind::InvalidCertificateAuthorityCertificate => {
                "The certificate authority's certificate is invalid"
            }
            CertErrorKind::InvalidCertificate => "The certificate is invalid",
            CertErrorKind::CertificateSignatureFailed => "The signature of the certificate is invalid",
            CertErrorKind::SelfSignedCertificate => "The certificate is self-signed and not in the trusted list",
            CertErrorKind::ExpiredCertificate => "The certificate has expired",
            CertErrorKind::RevokedCertificate => "The certificate has been revoked",
            CertErrorKind::InvalidCertificatePurpose => "The certificate is not suitable for this purpose",
            CertErrorKind::RejectedCertificate => "The root certificate authority rejects this purpose",
            CertErrorKind::UntrustedCertificate => "The certificate authority is not trusted",
            CertErrorKind::NoPeerCertificate => "The peer did not present any certificate",
            CertErrorKind::HostNameMismatch => "The certificate does not apply to the given host",
            CertErrorKind::PathLengthExceeded => "The certificate chain is too long",
        }
    }
}

impl fmt::Display for CertErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A validation problem, optionally tied to a certificate of the peer chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateError {
    pub kind: CertErrorKind,
    /// Index into the peer chain (0 = leaf)
    pub cert: Option<usize>,
}

impl CertificateError {
    pub fn new(kind: CertErrorKind, cert: Option<usize>) -> Self {
        CertificateError { kind, cert }
    }
}

impl fmt::Display for CertificateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cert {
            Some(index) => write!(f, "{} (certificate {})", self.kind, index),
            None => write!(f, "{}", self.kind),
        }
    }
}
