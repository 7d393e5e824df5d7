//! Connection layer errors
//!
//! Every failure of a connection attempt is surfaced as one of these
//! variants, verbatim, so that callers can map them onto their own
//! protocol-specific error reporting.

use crate::tls::{FailureStage, RejectReason, TlsError};
use crate::trust::StoreError;
use std::time::Duration;

/// Result type for connection operations
pub type Result<T> = std::result::Result<T, Error>;

/// Connection layer errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown host: {host} ({detail})")]
    UnknownHost { host: String, detail: String },

    #[error("Could not connect to {host} after {elapsed:?}: {detail}")]
    ConnectFailed {
        host: String,
        detail: String,
        elapsed: Duration,
    },

    #[error("TLS negotiation with {host} failed ({stage}): {detail}")]
    NegotiationFailed {
        host: String,
        stage: FailureStage,
        detail: String,
    },

    #[error("Certificate for {host} rejected: {reason}")]
    CertificateRejected { host: String, reason: RejectReason },

    #[error("User cancelled connection to {host}")]
    UserCancelled { host: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Encryption lost unexpectedly")]
    EncryptionLost,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Trust store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Whether this error belongs to the post-connect I/O failure family
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            Error::NotConnected | Error::ConnectionClosed | Error::EncryptionLost | Error::Io(_)
        )
    }
}
