//! TLS client configuration
//!
//! A [`TlsConfig`] carries two OpenSSL contexts: one for the preferred
//! (modern) protocol range and one for the legacy fallback range used by the
//! single downgrade retry.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// Inclusive protocol version range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: TlsVersion,
    pub max: TlsVersion,
}

impl VersionRange {
    pub fn new(min: TlsVersion, max: TlsVersion) -> Self {
        VersionRange { min, max }
    }

    pub fn only(version: TlsVersion) -> Self {
        VersionRange { min: version, max: version }
    }

    /// Modern protocols (TLS 1.2 and 1.3)
    pub fn modern() -> Self {
        VersionRange::new(TlsVersion::Tls12, TlsVersion::Tls13)
    }

    /// Legacy fallback protocols (TLS 1.0 and 1.1)
    pub fn legacy() -> Self {
        VersionRange::new(TlsVersion::Tls10, TlsVersion::Tls11)
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min.as_str())
        } else {
            write!(f, "{}-{}", self.min.as_str(), self.max.as_str())
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),
}

/// TLS client configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) preferred_ctx: openssl::ssl::SslContext,
    pub(crate) fallback_ctx: Option<openssl::ssl::SslContext>,
    pub(crate) preferred: VersionRange,
    pub(crate) fallback: Option<VersionRange>,
    pub(crate) handshake_timeout: Duration,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    pub fn preferred(&self) -> VersionRange {
        self.preferred
    }

    pub fn fallback(&self) -> Option<VersionRange> {
        self.fallback
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("preferred", &self.preferred)
            .field("fallback", &self.fallback)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

/// Client configuration builder
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    preferred: VersionRange,
    fallback: Option<VersionRange>,
    cipher_list: Option<String>,
    fallback_cipher_list: Option<String>,
    ciphersuites: Option<String>,
    ca_file: Option<PathBuf>,
    ca_dir: Option<PathBuf>,
    system_roots: bool,
    handshake_timeout: Duration,
}

impl ClientConfigBuilder {
    fn new() -> Self {
        ClientConfigBuilder {
            preferred: VersionRange::modern(),
            fallback: Some(VersionRange::legacy()),
            cipher_list: None,
            fallback_cipher_list: None,
            ciphersuites: None,
            ca_file: None,
            ca_dir: None,
            system_roots: true,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }

    /// Set the preferred protocol range
    pub fn preferred(mut self, range: VersionRange) -> Self {
        self.preferred = range;
        self
    }

    /// Set the fallback protocol range used after an early failure
    pub fn fallback(mut self, range: VersionRange) -> Self {
        self.fallback = Some(range);
        self
    }

    /// Never downgrade
    pub fn no_fallback(mut self) -> Self {
        self.fallback = None;
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.cipher_list = Some(ciphers.into());
        self
    }

    /// Set cipher list for the fallback context only
    pub fn fallback_cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.fallback_cipher_list = Some(ciphers.into());
        self
    }

    /// Set cipher suites (for TLS 1.3)
    pub fn ciphersuites(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphersuites = Some(ciphers.into());
        self
    }

    /// Trust the CA certificates in this PEM file
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Trust the CA certificates in this hashed directory
    pub fn ca_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_dir = Some(path.into());
        self
    }

    /// Load the system's default trust roots (on by default)
    pub fn system_roots(mut self, enable: bool) -> Self {
        self.system_roots = enable;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        if self.preferred.min > self.preferred.max {
            return Err(TlsError::InvalidConfig(format!(
                "preferred range {} is empty",
                self.preferred
            )));
        }
        if let Some(fallback) = self.fallback {
            if fallback.min > fallback.max {
                return Err(TlsError::InvalidConfig(format!(
                    "fallback range {} is empty",
                    fallback
                )));
            }
        }

        let preferred_ctx = self.build_context(self.preferred, self.cipher_list.as_deref())?;
        let fallback_ctx = match self.fallback {
            Some(range) => {
                let ciphers = self
                    .fallback_cipher_list
                    .as_deref()
                    .or(self.cipher_list.as_deref());
                Some(self.build_context(range, ciphers)?)
            }
            None => None,
        };

        Ok(TlsConfig {
            preferred_ctx,
            fallback_ctx,
            preferred: self.preferred,
            fallback: self.fallback,
            handshake_timeout: self.handshake_timeout,
        })
    }

    fn build_context(
        &self,
        range: VersionRange,
        cipher_list: Option<&str>,
    ) -> Result<openssl::ssl::SslContext, TlsError> {
        use openssl::ssl::{SslContextBuilder, SslMethod, SslVerifyMode};

        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx_builder.set_min_proto_version(Some(range.min.to_openssl_version()))?;
        ctx_builder.set_max_proto_version(Some(range.max.to_openssl_version()))?;

        // TLS 1.0/1.1 sign handshakes with MD5+SHA1, which security level 1
        // and up refuse. An explicit @SECLEVEL in the cipher list still wins.
        if range.max <= TlsVersion::Tls11 {
            ctx_builder.set_security_level(0);
        }

        if let Some(ciphers) = cipher_list {
            ctx_builder.set_cipher_list(ciphers)?;
        }
        if let Some(ref suites) = self.ciphersuites {
            ctx_builder.set_ciphersuites(suites)?;
        }

        if self.system_roots {
            ctx_builder.set_default_verify_paths()?;
        }
        if self.ca_file.is_some() || self.ca_dir.is_some() {
            ctx_builder.load_verify_locations(self.ca_file.as_deref(), self.ca_dir.as_deref())?;
        }

        // Verification results are collected per connection, never fatal here
        ctx_builder.set_verify(SslVerifyMode::PEER);

        Ok(ctx_builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("TLS1.0".parse::<TlsVersion>().unwrap(), TlsVersion::Tls10);
        assert!("invalid".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_default_client_config() {
        let config = TlsConfig::client().build().unwrap();
        assert_eq!(config.preferred(), VersionRange::modern());
        assert_eq!(config.fallback(), Some(VersionRange::legacy()));
        assert!(config.fallback_ctx.is_some());
        assert_eq!(
            config.handshake_timeout(),
            Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_no_fallback() {
        let config = TlsConfig::client().no_fallback().build().unwrap();
        assert!(config.fallback().is_none());
        assert!(config.fallback_ctx.is_none());
    }

    #[test]
    fn test_empty_range_rejected() {
        let result = TlsConfig::client()
            .preferred(VersionRange::new(TlsVersion::Tls13, TlsVersion::Tls12))
            .build();
        assert!(matches!(result, Err(TlsError::InvalidConfig(_))));
    }

    #[test]
    fn test_legacy_fallback_lowers_security_level() {
        let config = TlsConfig::client().build().unwrap();
        assert_eq!(config.fallback_ctx.as_ref().unwrap().security_level(), 0);
        assert!(config.preferred_ctx.security_level() > 0);

        let config = TlsConfig::client()
            .fallback_cipher_list("DEFAULT:@SECLEVEL=1")
            .build()
            .unwrap();
        assert_eq!(config.fallback_ctx.as_ref().unwrap().security_level(), 1);
    }

    #[test]
    fn test_range_display() {
        assert_eq!(VersionRange::modern().to_string(), "TLSv1.2-TLSv1.3");
        assert_eq!(VersionRange::only(TlsVersion::Tls12).to_string(), "TLSv1.2");
    }
}
