//! TLS negotiation and certificate trust
//!
//! # Architecture
//!
//! 1. `TlsConfig` holds the preferred and fallback version ranges, built once
//!    into OpenSSL contexts
//! 2. `TlsNegotiator` runs the handshake, deferring every verification error,
//!    and retries once at the fallback range after an early failure
//! 3. `CertificateValidator` turns the deferred errors into a trust decision
//!    using stored rules and, when allowed, the user
//! 4. `SessionMetadata` publishes what was negotiated to the caller
//!
//! # Examples
//!
//! ```no_run
//! use tlslink::tls::{TlsConfig, TlsVersion, VersionRange};
//! use std::time::Duration;
//!
//! let config = TlsConfig::client()
//!     .preferred(VersionRange::only(TlsVersion::Tls13))
//!     .fallback(VersionRange::only(TlsVersion::Tls12))
//!     .handshake_timeout(Duration::from_secs(5))
//!     .build()
//!     .unwrap();
//! assert!(config.fallback().is_some());
//! ```

pub mod cert;
pub mod config;
pub mod domain;
pub mod errors;
pub mod negotiator;
pub mod session;
pub mod validator;

pub use cert::PeerCertificate;
pub use config::{ClientConfigBuilder, TlsConfig, TlsError, TlsVersion, VersionRange};
pub use errors::{CertErrorKind, CertificateError};
pub use negotiator::{should_retry, Attempted, FailureStage, Negotiated, TlsNegotiator};
pub use session::{CipherDescriptor, SessionMetadata, TlsSession};
pub use validator::{reconcile, CertificateValidator, RejectReason, ValidationOutcome};
