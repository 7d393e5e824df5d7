//! Peer certificate handling
//!
//! Wraps an X.509 certificate from the peer chain and extracts what the
//! validator and the published metadata need: names, domain patterns,
//! thumbprint and PEM export.

use super::config::TlsError;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::x509::{X509, X509NameRef, X509Ref};

/// A certificate presented by the peer
#[derive(Clone)]
pub struct PeerCertificate {
    x509: X509,
}

impl PeerCertificate {
    pub fn new(x509: X509) -> Self {
        PeerCertificate { x509 }
    }

    pub fn from_ref(cert: &X509Ref) -> Self {
        PeerCertificate { x509: cert.to_owned() }
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        X509::from_pem(pem)
            .map(PeerCertificate::new)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))
    }

    pub fn x509(&self) -> &X509Ref {
        &self.x509
    }

    /// Subject Common Name, `<undef>` when absent
    pub fn subject(&self) -> String {
        first_cn(self.x509.subject_name())
    }

    /// Issuer Common Name, `<undef>` when absent
    pub fn issuer(&self) -> String {
        first_cn(self.x509.issuer_name())
    }

    /// All Common Name entries of the subject
    pub fn common_names(&self) -> Vec<String> {
        self.x509
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .filter_map(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string())
            .collect()
    }

    /// DNS-type Subject Alternative Names
    pub fn dns_names(&self) -> Vec<String> {
        self.x509
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subject Alternative Names rendered as `DNS:name` / `IP:addr`
    pub fn subject_alt_names(&self) -> Vec<String> {
        let mut names = Vec::new();

        if let Some(san_ext) = self.x509.subject_alt_names() {
            for name in san_ext {
                if let Some(dns) = name.dnsname() {
                    names.push(format!("DNS:{}", dns));
                } else if let Some(ip) = name.ipaddress() {
                    if let Ok(octets) = <[u8; 4]>::try_from(ip) {
                        names.push(format!("IP:{}", std::net::Ipv4Addr::from(octets)));
                    } else if let Ok(octets) = <[u8; 16]>::try_from(ip) {
                        names.push(format!("IP:{}", std::net::Ipv6Addr::from(octets)));
                    }
                }
            }
        }

        names
    }

    /// Every domain name pattern the certificate declares (CN + DNS SANs)
    pub fn domain_patterns(&self) -> Vec<String> {
        let mut patterns = self.common_names();
        patterns.extend(self.dns_names());
        patterns
    }

    /// SHA-256 of the DER encoding, lowercase hex
    pub fn thumbprint(&self) -> Result<String, TlsError> {
        let digest = self.x509.digest(MessageDigest::sha256())?;
        Ok(hex::encode(&*digest))
    }

    pub fn to_pem(&self) -> Result<String, TlsError> {
        let pem = self.x509.to_pem()?;
        String::from_utf8(pem).map_err(|e| TlsError::Certificate(e.to_string()))
    }
}

impl std::fmt::Debug for PeerCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCertificate")
            .field("subject", &self.subject())
            .field("issuer", &self.issuer())
            .finish()
    }
}

fn first_cn(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<undef>".to_string())
}

/// Extract the full peer chain, leaf first
pub fn peer_chain(ssl: &openssl::ssl::SslRef) -> Vec<PeerCertificate> {
    // On the client side the stack already starts with the leaf
    if let Some(stack) = ssl.peer_cert_chain() {
        if stack.len() > 0 {
            return stack.iter().map(PeerCertificate::from_ref).collect();
        }
    }

    ssl.peer_certificate()
        .map(|leaf| vec![PeerCertificate::new(leaf)])
        .unwrap_or_default()
}

/// Concatenate the PEM encodings of a chain
pub fn chain_to_pem(chain: &[PeerCertificate]) -> Result<String, TlsError> {
    let mut out = String::new();
    for cert in chain {
        out.push_str(&cert.to_pem()?);
    }
    Ok(out)
}
