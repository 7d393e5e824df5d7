//! Connection configuration
//!
//! Everything a connection needs to know up front: timeouts, read mode,
//! whether it may prompt, TLS settings, and the shared trust store and
//! resolver. Built once and cloned cheaply into each connection.

use crate::net::{AddressResolver, SystemResolver, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_READ_TIMEOUT_SECS};
use crate::tls::{TlsConfig, TlsError};
use crate::trust::{JsonRuleStore, MemoryRuleStore, TrustRuleStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Immutable connection configuration
#[derive(Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Wait indefinitely for incoming data instead of up to `read_timeout`
    pub blocking: bool,
    /// Never prompt; untrusted certificates are rejected
    pub no_ui: bool,
    /// Warn before a plain connection follows a secure one
    pub warn_on_leave_secure: bool,
    pub tls: TlsConfig,
    pub store: Arc<dyn TrustRuleStore>,
    pub resolver: Arc<dyn AddressResolver>,
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("blocking", &self.blocking)
            .field("no_ui", &self.no_ui)
            .field("warn_on_leave_secure", &self.warn_on_leave_secure)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Builder for [`ConnectionConfig`]
pub struct ConnectionConfigBuilder {
    connect_timeout: Duration,
    read_timeout: Duration,
    blocking: bool,
    no_ui: bool,
    warn_on_leave_secure: bool,
    tls: Option<TlsConfig>,
    store: Option<Arc<dyn TrustRuleStore>>,
    trust_file: Option<PathBuf>,
    resolver: Option<Arc<dyn AddressResolver>>,
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        ConnectionConfigBuilder {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            blocking: false,
            no_ui: false,
            warn_on_leave_secure: true,
            tls: None,
            store: None,
            trust_file: None,
            resolver: None,
        }
    }
}

impl ConnectionConfigBuilder {
    /// Total budget for connecting to all resolved addresses
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn no_ui(mut self, no_ui: bool) -> Self {
        self.no_ui = no_ui;
        self
    }

    pub fn warn_on_leave_secure(mut self, warn: bool) -> Self {
        self.warn_on_leave_secure = warn;
        self
    }

    /// TLS settings; by default the handshake shares the connect timeout
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn store(mut self, store: Arc<dyn TrustRuleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Persist trust rules in this JSON file
    pub fn trust_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_file = Some(path.into());
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Result<ConnectionConfig, TlsError> {
        let tls = match self.tls {
            Some(tls) => tls,
            None => TlsConfig::client().handshake_timeout(self.connect_timeout).build()?,
        };

        let store: Arc<dyn TrustRuleStore> = match (self.store, self.trust_file) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonRuleStore::new(path)),
            (None, None) => Arc::new(MemoryRuleStore::new()),
        };

        Ok(ConnectionConfig {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            blocking: self.blocking,
            no_ui: self.no_ui,
            warn_on_leave_secure: self.warn_on_leave_secure,
            tls,
            store,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(SystemResolver)),
        })
    }
}
