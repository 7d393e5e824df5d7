//! Negotiated session data and published metadata
//!
//! [`TlsSession`] is captured right after a successful handshake.
//! [`SessionMetadata`] is the caller-facing view of it, available even when
//! certificate validation later rejects the connection.

use super::cert::{chain_to_pem, PeerCertificate};
use super::errors::CertificateError;
use openssl::ssl::SslRef;
use std::net::IpAddr;

/// Description of the negotiated cipher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipherDescriptor {
    pub name: String,
    pub encryption: String,
    pub authentication: String,
    pub key_exchange: String,
    pub digest: String,
    /// Key strength actually used
    pub used_bits: u32,
    /// Key strength supported by the algorithm
    pub bits: u32,
}

impl CipherDescriptor {
    /// Build from an OpenSSL description line such as
    /// `ECDHE-RSA-AES256-GCM-SHA384 TLSv1.2 Kx=ECDH Au=RSA Enc=AESGCM(256) Mac=AEAD`
    pub fn from_description(name: &str, description: &str, used_bits: u32, bits: u32) -> Self {
        let mut descriptor = CipherDescriptor {
            name: name.to_string(),
            used_bits,
            bits,
            ..Default::default()
        };

        for field in description.split_whitespace() {
            if let Some((key, value)) = field.split_once('=') {
                let value = value.to_string();
                match key {
                    "Kx" => descriptor.key_exchange = value,
                    "Au" => descriptor.authentication = value,
                    "Enc" => descriptor.encryption = value,
                    "Mac" => descriptor.digest = value,
                    _ => {}
                }
            }
        }

        descriptor
    }

    /// Describe the current cipher of an SSL connection, if any
    pub fn from_ssl(ssl: &SslRef) -> Option<Self> {
        let cipher = ssl.current_cipher()?;
        let bits = cipher.bits();
        Some(CipherDescriptor::from_description(
            cipher.name(),
            &cipher.description(),
            u32::try_from(bits.secret).unwrap_or(0),
            u32::try_from(bits.algorithm).unwrap_or(0),
        ))
    }
}

/// Session captured after a successful handshake
#[derive(Debug, Clone)]
pub struct TlsSession {
    /// Negotiated protocol version (e.g., "TLSv1.3")
    pub protocol_version: String,
    pub cipher: CipherDescriptor,
    /// Peer certificate chain (index 0 is the leaf)
    pub chain: Vec<PeerCertificate>,
}

impl TlsSession {
    pub fn leaf(&self) -> Option<&PeerCertificate> {
        self.chain.first()
    }
}

/// Metadata published to the caller for a connection
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    /// Whether the connection is (still) encrypted
    pub in_use: bool,
    pub protocol_version: Option<String>,
    pub cipher: Option<CipherDescriptor>,
    pub peer_ip: Option<IpAddr>,
    pub chain: Vec<PeerCertificate>,
    /// Outstanding error codes, one list per certificate of the chain
    pub cert_errors: Vec<Vec<u8>>,
    /// Validation verdict, `accept` or `reject`
    pub action: Option<String>,
}

impl SessionMetadata {
    /// Publish a freshly negotiated session
    pub fn from_session(session: &TlsSession, peer_ip: IpAddr, errors: &[CertificateError]) -> Self {
        let mut metadata = SessionMetadata {
            in_use: true,
            protocol_version: Some(session.protocol_version.clone()),
            cipher: Some(session.cipher.clone()),
            peer_ip: Some(peer_ip),
            chain: session.chain.clone(),
            cert_errors: Vec::new(),
            action: None,
        };
        metadata.set_errors(errors);
        metadata
    }

    /// Replace the per-certificate error codes
    pub fn set_errors(&mut self, errors: &[CertificateError]) {
        let mut per_cert = vec![Vec::new(); self.chain.len()];
        for error in errors {
            let index = error.cert.unwrap_or(0);
            if let Some(codes) = per_cert.get_mut(index) {
                if !codes.contains(&error.kind.code()) {
                    codes.push(error.kind.code());
                }
            }
        }
        self.cert_errors = per_cert;
    }

    /// PEM export of the whole chain
    pub fn chain_pem(&self) -> String {
        chain_to_pem(&self.chain).unwrap_or_default()
    }

    /// Error codes encoded per certificate: `\n` between certificates, `\t` between codes
    pub fn encoded_cert_errors(&self) -> String {
        self.cert_errors
            .iter()
            .map(|codes| {
                codes
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join("\t")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Get certificate info by index (0 = leaf)
    pub fn cert(&self, index: usize) -> Option<&PeerCertificate> {
        self.chain.get(index)
    }

    /// Get variable by name
    pub fn get(&self, name: &str) -> Option<String> {
        let cipher = self.cipher.as_ref();
        match name {
            "tls.in_use" => Some(if self.in_use { "true" } else { "false" }.to_string()),
            "tls.protocol_version" => self.protocol_version.clone(),
            "tls.cipher" => cipher.map(|c| c.name.clone()),
            "tls.cipher.encryption" => cipher.map(|c| c.encryption.clone()),
            "tls.cipher.authentication" => cipher.map(|c| c.authentication.clone()),
            "tls.cipher.key_exchange" => cipher.map(|c| c.key_exchange.clone()),
            "tls.cipher.digest" => cipher.map(|c| c.digest.clone()),
            "tls.cipher.used_bits" => cipher.map(|c| c.used_bits.to_string()),
            "tls.cipher.bits" => cipher.map(|c| c.bits.to_string()),
            "tls.peer_ip" => self.peer_ip.map(|ip| ip.to_string()),
            "tls.peer_chain" => Some(self.chain_pem()),
            "tls.cert_errors" => Some(self.encoded_cert_errors()),
            "tls.action" => self.action.clone(),
            _ => {
                if name.starts_with("tls.cert") {
                    self.get_cert_var(name)
                } else {
                    None
                }
            }
        }
    }

    /// Get certificate variable: `tls.certN.field` or `tls.cert.field` (N = 0)
    fn get_cert_var(&self, name: &str) -> Option<String> {
        let remaining = name.strip_prefix("tls.cert")?;

        let (index, field) = if let Some(field) = remaining.strip_prefix('.') {
            (0, field)
        } else {
            let (index_str, field) = remaining.split_once('.')?;
            (index_str.parse::<usize>().ok()?, field)
        };

        let cert = self.cert(index)?;

        match field {
            "subject" => Some(cert.subject()),
            "issuer" => Some(cert.issuer()),
            "thumbprint" => cert.thumbprint().ok(),
            "subject_alt_names" => {
                let sans = cert.subject_alt_names();
                if sans.is_empty() {
                    Some("<undef>".to_string())
                } else {
                    Some(sans.join(", "))
                }
            }
            _ => None,
        }
    }

    /// All top-level variables as ordered pairs
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        const KEYS: [&str; 13] = [
            "tls.in_use",
            "tls.protocol_version",
            "tls.cipher",
            "tls.cipher.encryption",
            "tls.cipher.authentication",
            "tls.cipher.key_exchange",
            "tls.cipher.digest",
            "tls.cipher.used_bits",
            "tls.cipher.bits",
            "tls.peer_ip",
            "tls.peer_chain",
            "tls.cert_errors",
            "tls.action",
        ];

        KEYS.iter()
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cert::testing::example_com;
    use crate::tls::errors::CertErrorKind;

    fn sample_session() -> TlsSession {
        TlsSession {
            protocol_version: "TLSv1.2".to_string(),
            cipher: CipherDescriptor::from_description(
                "ECDHE-RSA-AES256-GCM-SHA384",
                "ECDHE-RSA-AES256-GCM-SHA384 TLSv1.2 Kx=ECDH     Au=RSA  Enc=AESGCM(256) Mac=AEAD\n",
                256,
                256,
            ),
            chain: vec![example_com(), example_com()],
        }
    }

    #[test]
    fn test_cipher_description_parsing() {
        let cipher = sample_session().cipher;
        assert_eq!(cipher.key_exchange, "ECDH");
        assert_eq!(cipher.authentication, "RSA");
        assert_eq!(cipher.encryption, "AESGCM(256)");
        assert_eq!(cipher.digest, "AEAD");
        assert_eq!(cipher.used_bits, 256);
    }

    #[test]
    fn test_default_metadata() {
        let meta = SessionMetadata::default();
        assert_eq!(meta.get("tls.in_use"), Some("false".to_string()));
        assert_eq!(meta.get("tls.cipher"), None);
        assert_eq!(meta.get("tls.cert.subject"), None);
        assert_eq!(meta.get("tls.bogus"), None);
    }

    #[test]
    fn test_cert_errors_grouped_per_certificate() {
        let errors = [
            CertificateError::new(CertErrorKind::SelfSignedCertificate, Some(0)),
            CertificateError::new(CertErrorKind::HostNameMismatch, None),
            CertificateError::new(CertErrorKind::ExpiredCertificate, Some(1)),
            CertificateError::new(CertErrorKind::ExpiredCertificate, Some(7)),
        ];
        let meta = SessionMetadata::from_session(&sample_session(), "127.0.0.1".parse().unwrap(), &errors);

        assert_eq!(meta.cert_errors, vec![vec![5, 12], vec![6]]);
        assert_eq!(meta.get("tls.cert_errors"), Some("5\t12\n6".to_string()));
    }

    #[test]
    fn test_cert_var_parsing() {
        let meta = SessionMetadata::from_session(&sample_session(), "10.0.0.1".parse().unwrap(), &[]);

        assert_eq!(meta.get("tls.cert.subject"), Some("example.com".to_string()));
        assert_eq!(meta.get("tls.cert1.issuer"), Some("example.com".to_string()));
        assert_eq!(meta.get("tls.cert9.subject"), None);
        assert_eq!(meta.get("tls.peer_ip"), Some("10.0.0.1".to_string()));

        let sans = meta.get("tls.cert.subject_alt_names").unwrap();
        assert!(sans.contains("DNS:*.example.com"));
        assert_eq!(meta.get("tls.cert.thumbprint").map(|t| t.len()), Some(64));
    }

    #[test]
    fn test_pairs_export() {
        let mut meta = SessionMetadata::from_session(&sample_session(), "10.0.0.1".parse().unwrap(), &[]);
        meta.action = Some("accept".to_string());

        let pairs = meta.to_pairs();
        assert_eq!(pairs.len(), 13);
        assert_eq!(pairs[0], ("tls.in_use".to_string(), "true".to_string()));
        assert!(pairs.iter().any(|(k, v)| k == "tls.peer_chain" && v.contains("BEGIN CERTIFICATE")));
        assert!(pairs.iter().any(|(k, v)| k == "tls.action" && v == "accept"));
    }
}
