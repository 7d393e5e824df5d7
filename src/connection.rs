//! Client connection driver
//!
//! [`TcpConnection`] runs the whole pipeline for one endpoint: resolve,
//! connect within the budget, negotiate TLS, validate the certificate, and
//! hand reads and writes to the [`IoChannel`]. One operation runs at a time;
//! all methods take `&mut self`.

use crate::channel::{IoChannel, PlainTransport, TlsTransport, Transport};
use crate::config::ConnectionConfig;
use crate::interaction::{InteractionPort, LeaveChoice};
use crate::net::establish;
use crate::tls::{
    reconcile, CertificateValidator, Negotiated, RejectReason, SessionMetadata, TlsNegotiator, TlsSession,
    ValidationOutcome,
};
use crate::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    TcpConnected,
    HandshakeAttempted,
    Secured,
    Failed,
}

/// Requested transport security
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    Plain,
    Tls,
}

/// Per-call connect options
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Overrides the connection's default mode
    pub encryption: Option<Encryption>,
    /// The previous request was served over TLS
    pub was_secure: bool,
}

/// Result of a successful connect
#[derive(Debug, Clone, Copy)]
pub struct ConnectOutcome {
    pub secured: bool,
    pub peer: SocketAddr,
    /// Certificate verdict; `None` for plain connections
    pub validation: Option<ValidationOutcome>,
}

/// Where a connection goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub peer: SocketAddr,
}

/// A client connection to one endpoint at a time
pub struct TcpConnection {
    config: ConnectionConfig,
    port: Box<dyn InteractionPort>,
    negotiator: TlsNegotiator,
    default_port: u16,
    auto_tls: bool,
    state: ConnectionState,
    channel: IoChannel,
    endpoint: Option<Endpoint>,
    session: Option<TlsSession>,
    metadata: SessionMetadata,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("state", &self.state)
            .field("endpoint", &self.endpoint)
            .field("default_port", &self.default_port)
            .field("auto_tls", &self.auto_tls)
            .finish()
    }
}

impl TcpConnection {
    /// Create a connection
    ///
    /// `default_port` is used when `connect` is given port 0; `auto_tls`
    /// selects TLS unless a connect call overrides it.
    pub fn new(config: ConnectionConfig, port: Box<dyn InteractionPort>, default_port: u16, auto_tls: bool) -> Self {
        let negotiator = TlsNegotiator::new(config.tls.clone());
        TcpConnection {
            config,
            port,
            negotiator,
            default_port,
            auto_tls,
            state: ConnectionState::Disconnected,
            channel: IoChannel::disconnected(),
            endpoint: None,
            session: None,
            metadata: SessionMetadata::default(),
        }
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<ConnectOutcome> {
        self.connect_with(host, port, ConnectOptions::default())
    }

    pub fn connect_with(&mut self, host: &str, port: u16, options: ConnectOptions) -> Result<ConnectOutcome> {
        self.disconnect();

        let port = if port == 0 { self.default_port } else { port };
        let encryption = options.encryption.unwrap_or(if self.auto_tls {
            Encryption::Tls
        } else {
            Encryption::Plain
        });

        if encryption == Encryption::Plain
            && options.was_secure
            && self.config.warn_on_leave_secure
            && !self.config.no_ui
            && self.port.confirm_leave_secure(host) == LeaveChoice::Cancel
        {
            info!(host, "user declined to leave secure mode");
            return Err(Error::UserCancelled { host: host.to_string() });
        }

        let addresses = self.config.resolver.resolve(host)?;
        let established = establish(host, &addresses, port, self.config.connect_timeout)?;
        let peer = established.peer;
        self.endpoint = Some(Endpoint {
            host: host.to_string(),
            port,
            addresses,
            peer,
        });
        self.state = ConnectionState::TcpConnected;
        info!(host, %peer, ?encryption, "TCP connection established");

        if encryption == Encryption::Plain {
            self.channel = IoChannel::new(
                Box::new(PlainTransport::new(established.stream)),
                self.config.blocking,
                self.config.read_timeout,
            );
            return Ok(ConnectOutcome {
                secured: false,
                peer,
                validation: None,
            });
        }

        self.state = ConnectionState::HandshakeAttempted;
        let budget = self.config.connect_timeout;
        let redial = || establish(host, &[peer.ip()], port, budget).map(|e| e.stream);
        let negotiated = match self.negotiator.negotiate(host, established.stream, redial) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.state = ConnectionState::Failed;
                return Err(e);
            }
        };

        let validation = self.secure(host, peer, negotiated)?;
        Ok(ConnectOutcome {
            secured: true,
            peer,
            validation: Some(validation),
        })
    }

    /// Upgrade the current plain connection to TLS in place
    ///
    /// No version fallback is attempted. Unread plaintext must not be
    /// buffered, since it would be lost.
    pub fn start_tls(&mut self) -> Result<ValidationOutcome> {
        if self.state != ConnectionState::TcpConnected || self.channel.is_encrypted() {
            return Err(Error::InvalidState(format!("cannot start TLS in state {:?}", self.state)));
        }
        let (host, peer) = match &self.endpoint {
            Some(endpoint) => (endpoint.host.clone(), endpoint.peer),
            None => return Err(Error::NotConnected),
        };

        let transport = self.channel.take_transport()?;
        let stream = transport
            .into_tcp()
            .ok_or_else(|| Error::InvalidState("transport cannot be upgraded".to_string()))?;

        self.state = ConnectionState::HandshakeAttempted;
        let negotiated = match self.negotiator.upgrade(&host, stream) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.state = ConnectionState::Failed;
                return Err(e);
            }
        };

        self.secure(&host, peer, negotiated)
    }

    /// Publish the session, validate the certificate and install the channel
    fn secure(&mut self, host: &str, peer: SocketAddr, negotiated: Negotiated) -> Result<ValidationOutcome> {
        let Negotiated {
            stream,
            session,
            errors,
            ..
        } = negotiated;

        let reconciled = reconcile(host, &session.chain, &errors);
        self.metadata = SessionMetadata::from_session(&session, peer.ip(), &reconciled);

        let mut validator = CertificateValidator::new(self.config.store.as_ref(), self.port.as_mut(), self.config.no_ui);
        let verdict = validator.validate(host, &session.chain, &errors);
        self.session = Some(session);

        let outcome = match verdict {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = ConnectionState::Failed;
                self.metadata.in_use = false;
                return Err(e);
            }
        };
        self.metadata.action = Some(outcome.action().to_string());

        match outcome {
            ValidationOutcome::Rejected(reason) => {
                warn!(host, %reason, "certificate rejected");
                let mut transport = TlsTransport::new(stream);
                if let Err(e) = transport.close() {
                    debug!(host, error = %e, "error while closing rejected session");
                }
                self.state = ConnectionState::Failed;
                self.metadata.in_use = false;
                Err(match reason {
                    RejectReason::UserCancelled => Error::UserCancelled { host: host.to_string() },
                    reason => Error::CertificateRejected {
                        host: host.to_string(),
                        reason,
                    },
                })
            }
            outcome => {
                debug!(host, ?outcome, "certificate accepted");
                self.channel = IoChannel::new(
                    Box::new(TlsTransport::new(stream)),
                    self.config.blocking,
                    self.config.read_timeout,
                );
                self.state = ConnectionState::Secured;
                Ok(outcome)
            }
        }
    }

    /// Close the connection and forget the endpoint and session
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!(endpoint = ?self.endpoint.as_ref().map(|e| e.peer), "disconnecting");
        }
        self.channel.close();
        self.state = ConnectionState::Disconnected;
        self.endpoint = None;
        self.session = None;
        self.metadata = SessionMetadata::default();
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn is_using_tls(&self) -> bool {
        self.state == ConnectionState::Secured && self.channel.is_encrypted()
    }

    /// Negotiated session, kept even when validation rejected it
    pub fn session(&self) -> Option<&TlsSession> {
        self.session.as_ref()
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.config.blocking = blocking;
        self.channel.set_blocking(blocking);
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.config.read_timeout = timeout;
        self.channel.set_read_timeout(timeout);
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let result = self.channel.write(buf);
        self.track(result)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.channel.read(buf);
        self.track(result)
    }

    pub fn read_line(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.channel.read_line(buf);
        self.track(result)
    }

    pub fn wait_for_response(&mut self, timeout: Duration) -> Result<bool> {
        let result = self.channel.wait_for_response(timeout);
        self.track(result)
    }

    pub fn is_connection_valid(&mut self) -> bool {
        let valid = self.channel.is_connection_valid();
        self.sync_channel_state();
        valid
    }

    pub fn at_end(&mut self) -> bool {
        let at_end = self.channel.at_end();
        self.sync_channel_state();
        at_end
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.sync_channel_state();
        }
        result
    }

    /// Follow a channel that dropped its transport after a failure
    fn sync_channel_state(&mut self) {
        if !self.channel.is_connected() && self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "connection lost");
            self.state = ConnectionState::Disconnected;
            self.metadata.in_use = false;
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::{CertificateIssue, Durability, IssueChoice, RejectAll};
    use crate::net::AddressResolver;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct Loopback;

    impl AddressResolver for Loopback {
        fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            match host {
                "service.test" => Ok(vec!["127.0.0.1".parse().unwrap()]),
                _ => Err(Error::UnknownHost {
                    host: host.to_string(),
                    detail: "not in test table".to_string(),
                }),
            }
        }
    }

    struct CountingPort {
        leave_prompts: Arc<AtomicUsize>,
        answer: LeaveChoice,
    }

    impl InteractionPort for CountingPort {
        fn present_certificate_issue(&mut self, _issue: &CertificateIssue<'_>) -> IssueChoice {
            IssueChoice::Cancel
        }

        fn choose_durability(&mut self, _host: &str) -> Durability {
            Durability::SessionOnly
        }

        fn confirm_leave_secure(&mut self, _host: &str) -> LeaveChoice {
            self.leave_prompts.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::builder()
            .resolver(Arc::new(Loopback))
            .read_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn echo_server() -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(&buf[..n]).unwrap();
        });
        (port, handle)
    }

    #[test]
    fn test_plain_connect_uses_default_port() {
        let (port, handle) = echo_server();
        let mut conn = TcpConnection::new(config(), Box::new(RejectAll), port, false);

        let outcome = conn.connect("service.test", 0).unwrap();
        assert!(!outcome.secured);
        assert!(outcome.validation.is_none());
        assert_eq!(conn.state(), ConnectionState::TcpConnected);
        assert_eq!(conn.endpoint().unwrap().port, port);
        assert!(!conn.is_using_tls());

        conn.write(b"hello\n").unwrap();
        let mut line = [0u8; 16];
        let n = conn.read_line(&mut line).unwrap();
        assert_eq!(&line[..n], b"hello\n");

        handle.join().unwrap();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.endpoint().is_none());
        assert!(matches!(conn.write(b"x"), Err(Error::NotConnected)));
    }

    #[test]
    fn test_unknown_host() {
        let mut conn = TcpConnection::new(config(), Box::new(RejectAll), 80, false);
        assert!(matches!(conn.connect("nowhere.test", 80), Err(Error::UnknownHost { .. })));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_leave_secure_cancel() {
        let prompts = Arc::new(AtomicUsize::new(0));
        let port = CountingPort {
            leave_prompts: Arc::clone(&prompts),
            answer: LeaveChoice::Cancel,
        };
        let mut conn = TcpConnection::new(config(), Box::new(port), 80, false);

        let options = ConnectOptions {
            encryption: None,
            was_secure: true,
        };
        let result = conn.connect_with("service.test", 1, options);
        assert!(matches!(result, Err(Error::UserCancelled { .. })));
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_leave_secure_continue() {
        let (server_port, handle) = echo_server();
        let prompts = Arc::new(AtomicUsize::new(0));
        let port = CountingPort {
            leave_prompts: Arc::clone(&prompts),
            answer: LeaveChoice::Continue,
        };
        let mut conn = TcpConnection::new(config(), Box::new(port), 443, true);

        let options = ConnectOptions {
            encryption: Some(Encryption::Plain),
            was_secure: true,
        };
        let outcome = conn.connect_with("service.test", server_port, options).unwrap();
        assert!(!outcome.secured);
        assert_eq!(prompts.load(Ordering::SeqCst), 1);

        conn.write(b"x").unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_start_tls_requires_plain_connection() {
        let mut conn = TcpConnection::new(config(), Box::new(RejectAll), 25, false);
        assert!(matches!(conn.start_tls(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_read_timeout_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(stream);
        });

        let config = ConnectionConfig::builder()
            .resolver(Arc::new(Loopback))
            .read_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let mut conn = TcpConnection::new(config, Box::new(RejectAll), port, false);
        conn.connect("service.test", 0).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
        assert!(conn.is_connected());

        handle.join().unwrap();
        conn.set_read_timeout(Duration::from_secs(5));
        assert!(matches!(conn.read(&mut buf), Err(Error::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
