//! TLS negotiation with a single version downgrade
//!
//! The handshake runs with peer verification enabled, but every verification
//! problem is recorded and the handshake is allowed to continue. Trust is
//! decided afterwards by the certificate validator, so the negotiator never
//! fails because of a certificate.
//!
//! Failures are classified as [`FailureStage::Early`] (the handshake was
//! refused or produced an unusable session) or [`FailureStage::Late`] (the
//! handshake ran out of time, or the connection already carried plaintext
//! application data). Only an early failure at the preferred version range is
//! retried, once, at the fallback range on a freshly dialled connection.

use super::cert::peer_chain;
use super::config::{TlsConfig, TlsError, VersionRange};
use super::errors::{CertErrorKind, CertificateError};
use super::session::{CipherDescriptor, TlsSession};
use crate::net::resolver::parse_ip_literal;
use crate::{Error, Result};
use openssl::ssl::{HandshakeError, Ssl, SslContext, SslStream, SslVerifyMode};
use std::io;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// When a negotiation failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Before any application data; eligible for the version downgrade
    Early,
    /// Not eligible for a retry
    Late,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureStage::Early => f.write_str("early"),
            FailureStage::Late => f.write_str("late"),
        }
    }
}

/// Which version range an attempt used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempted {
    Preferred,
    Fallback,
}

/// Outcome of a single handshake attempt
#[derive(Debug)]
enum AttemptOutcome {
    Secured(Box<Negotiated>),
    Retryable(String),
    Fatal(FailureStage, String),
}

/// Decide whether a failed attempt earns the downgrade retry
pub fn should_retry(stage: FailureStage, attempted: Attempted, fallback_available: bool) -> bool {
    stage == FailureStage::Early && attempted == Attempted::Preferred && fallback_available
}

/// A secured stream plus everything learned during the handshake
pub struct Negotiated {
    pub stream: SslStream<TcpStream>,
    pub session: TlsSession,
    /// Raw verification problems, deferred for the validator
    pub errors: Vec<CertificateError>,
    pub version: VersionRange,
    /// Number of handshakes performed (1 or 2)
    pub attempts: u32,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("session", &self.session)
            .field("errors", &self.errors)
            .field("version", &self.version)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Drives the client side of the TLS handshake
#[derive(Debug, Clone)]
pub struct TlsNegotiator {
    config: TlsConfig,
}

impl TlsNegotiator {
    pub fn new(config: TlsConfig) -> Self {
        TlsNegotiator { config }
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// Negotiate over a fresh connection
    ///
    /// `redial` opens a new TCP connection to the same endpoint; it is only
    /// called for the downgrade retry.
    pub fn negotiate<F>(&self, host: &str, stream: TcpStream, mut redial: F) -> Result<Negotiated>
    where
        F: FnMut() -> Result<TcpStream>,
    {
        let mut stream = stream;
        let mut attempted = Attempted::Preferred;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let (ctx, range) = match attempted {
                Attempted::Preferred => (&self.config.preferred_ctx, self.config.preferred),
                Attempted::Fallback => match (&self.config.fallback_ctx, self.config.fallback) {
                    (Some(ctx), Some(range)) => (ctx, range),
                    _ => {
                        return Err(Error::InvalidState("fallback context missing".to_string()));
                    }
                },
            };

            debug!(host, version = %range, attempt = attempts, "starting TLS handshake");

            let (stage, detail) = match self.attempt(ctx, range, host, stream, FailureStage::Early)? {
                AttemptOutcome::Secured(mut negotiated) => {
                    negotiated.attempts = attempts;
                    info!(
                        host,
                        version = %negotiated.session.protocol_version,
                        cipher = %negotiated.session.cipher.name,
                        "TLS session established"
                    );
                    return Ok(*negotiated);
                }
                AttemptOutcome::Retryable(detail) => (FailureStage::Early, detail),
                AttemptOutcome::Fatal(stage, detail) => (stage, detail),
            };

            if should_retry(stage, attempted, self.config.fallback_ctx.is_some()) {
                info!(host, error = %detail, "handshake failed early, retrying with fallback versions");
                stream = redial()?;
                attempted = Attempted::Fallback;
                continue;
            }

            warn!(host, %stage, error = %detail, "TLS negotiation failed");
            return Err(Error::NegotiationFailed {
                host: host.to_string(),
                stage,
                detail,
            });
        }
    }

    /// Upgrade a connection that already exchanged plaintext (STARTTLS)
    ///
    /// Every failure is late: the connection cannot be replayed at another
    /// version.
    pub fn upgrade(&self, host: &str, stream: TcpStream) -> Result<Negotiated> {
        let range = self.config.preferred;
        debug!(host, version = %range, "upgrading connection to TLS");

        match self.attempt(&self.config.preferred_ctx, range, host, stream, FailureStage::Late)? {
            AttemptOutcome::Secured(mut negotiated) => {
                negotiated.attempts = 1;
                Ok(*negotiated)
            }
            AttemptOutcome::Retryable(detail) | AttemptOutcome::Fatal(_, detail) => {
                warn!(host, error = %detail, "TLS upgrade failed");
                Err(Error::NegotiationFailed {
                    host: host.to_string(),
                    stage: FailureStage::Late,
                    detail,
                })
            }
        }
    }

    fn attempt(
        &self,
        ctx: &SslContext,
        range: VersionRange,
        host: &str,
        stream: TcpStream,
        refused_stage: FailureStage,
    ) -> Result<AttemptOutcome> {
        let collected: Arc<Mutex<Vec<(i32, u32)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut ssl = Ssl::new(ctx).map_err(TlsError::from)?;
        match parse_ip_literal(host) {
            Some(ip) => ssl.param_mut().set_ip(ip).map_err(TlsError::from)?,
            None => {
                ssl.set_hostname(host).map_err(TlsError::from)?;
                ssl.param_mut().set_host(host).map_err(TlsError::from)?;
            }
        }

        let sink = Arc::clone(&collected);
        ssl.set_verify_callback(SslVerifyMode::PEER, move |preverify_ok, x509_ctx| {
            if !preverify_ok {
                if let Ok(mut errors) = sink.lock() {
                    errors.push((x509_ctx.error().as_raw(), x509_ctx.error_depth()));
                }
            }
            // Defer the decision to the validator
            true
        });

        let timeout = self.config.handshake_timeout;
        let saved = (stream.read_timeout()?, stream.write_timeout()?);
        stream.set_read_timeout(non_zero(timeout))?;
        stream.set_write_timeout(non_zero(timeout))?;

        let ssl_stream = match ssl.connect(stream) {
            Ok(s) => s,
            Err(HandshakeError::SetupFailure(e)) => return Err(TlsError::from(e).into()),
            Err(HandshakeError::WouldBlock(mid)) => {
                // Socket timeouts surface as a blocked handshake
                let detail = format!("handshake with {} timed out: {}", range, mid.error());
                return Ok(AttemptOutcome::Fatal(FailureStage::Late, detail));
            }
            Err(HandshakeError::Failure(mid)) => {
                let error = mid.error();
                let timed_out = error
                    .io_error()
                    .map(|e| matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
                    .unwrap_or(false);
                let detail = format!("handshake with {} failed: {}", range, error);
                return Ok(if timed_out {
                    AttemptOutcome::Fatal(FailureStage::Late, detail)
                } else if refused_stage == FailureStage::Early {
                    AttemptOutcome::Retryable(detail)
                } else {
                    AttemptOutcome::Fatal(refused_stage, detail)
                });
            }
        };

        ssl_stream.get_ref().set_read_timeout(saved.0)?;
        ssl_stream.get_ref().set_write_timeout(saved.1)?;

        let ssl = ssl_stream.ssl();
        let chain = peer_chain(ssl);
        let cipher = match CipherDescriptor::from_ssl(ssl) {
            Some(cipher) if cipher.used_bits > 0 => cipher,
            _ => return Ok(unusable(refused_stage, "no usable cipher negotiated")),
        };
        if chain.is_empty() {
            return Ok(unusable(refused_stage, "peer presented no certificate chain"));
        }

        let raw = collected.lock().map(|errors| errors.clone()).unwrap_or_default();
        let errors = collect_errors(&raw);
        if !errors.is_empty() {
            debug!(host, count = errors.len(), "certificate problems deferred to validation");
        }

        let session = TlsSession {
            protocol_version: ssl.version_str().to_string(),
            cipher,
            chain,
        };

        Ok(AttemptOutcome::Secured(Box::new(Negotiated {
            stream: ssl_stream,
            session,
            errors,
            version: range,
            attempts: 0,
        })))
    }
}

fn unusable(stage: FailureStage, detail: &str) -> AttemptOutcome {
    match stage {
        FailureStage::Early => AttemptOutcome::Retryable(detail.to_string()),
        FailureStage::Late => AttemptOutcome::Fatal(stage, detail.to_string()),
    }
}

fn non_zero(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

/// Map raw `(X509_V_ERR code, depth)` pairs, dropping duplicates
fn collect_errors(raw: &[(i32, u32)]) -> Vec<CertificateError> {
    let mut errors: Vec<CertificateError> = Vec::with_capacity(raw.len());
    for &(code, depth) in raw {
        let error = CertificateError::new(
            CertErrorKind::from_openssl(code),
            usize::try_from(depth).ok(),
        );
        if !errors.contains(&error) {
            errors.push(error);
        }
    }
    errors
}
