//! tlslink - blocking TLS client connection layer
//!
//! This crate provides the connection layer of an out-of-process fetching
//! worker: name resolution, sequential TCP connects within a time budget,
//! TLS negotiation with a single version fallback, certificate validation
//! against persisted trust rules, and a blocking read/write channel.
//!
//! # Architecture
//!
//! ```text
//! AddressResolver -> establish -> TlsNegotiator -> CertificateValidator -> IoChannel
//!                                                    |            |
//!                                            TrustRuleStore  InteractionPort
//! ```
//!
//! [`TcpConnection`] drives the whole pipeline and is the entry point for
//! callers.
//!
//! # Examples
//!
//! ```no_run
//! use tlslink::{ConnectionConfig, TcpConnection, RejectAll};
//!
//! let config = ConnectionConfig::builder().no_ui(true).build().unwrap();
//! let mut conn = TcpConnection::new(config, Box::new(RejectAll), 443, true);
//!
//! let outcome = conn.connect("example.com", 0).unwrap();
//! assert!(outcome.secured);
//!
//! conn.write(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n").unwrap();
//! let mut line = [0u8; 1024];
//! let n = conn.read_line(&mut line).unwrap();
//! println!("{}", String::from_utf8_lossy(&line[..n]));
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod interaction;
pub mod net;
pub mod tls;
pub mod trust;

pub use channel::{IoChannel, PlainTransport, PollEvents, TlsTransport, Transport};
pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use connection::{ConnectOptions, ConnectOutcome, ConnectionState, Encryption, Endpoint, TcpConnection};
pub use error::{Error, Result};
pub use interaction::{CertificateIssue, Durability, InteractionPort, IssueChoice, LeaveChoice, RejectAll};
pub use tls::{
    CertificateError, CertificateValidator, CertErrorKind, CipherDescriptor, FailureStage,
    PeerCertificate, RejectReason, SessionMetadata, TlsConfig, TlsError, TlsNegotiator,
    TlsSession, TlsVersion, ValidationOutcome,
};
pub use trust::{JsonRuleStore, MemoryRuleStore, StoreError, TrustRule, TrustRuleStore};
