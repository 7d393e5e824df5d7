//! Shared helpers for integration tests
#![allow(dead_code)]

use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslMethod, SslOptions, SslStream, SslVersion};
use openssl::x509::X509;
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tlslink::interaction::{CertificateIssue, Durability, InteractionPort, IssueChoice, LeaveChoice};
use tlslink::net::AddressResolver;

/// Self-signed certificate for example.com and *.example.com, with its key
pub const EXAMPLE_COM_PEM: &str = include_str!("example_com.pem");

/// Server context presenting the example.com certificate
pub fn acceptor(min: SslVersion, max: SslVersion) -> SslAcceptor {
    let cert = X509::from_pem(EXAMPLE_COM_PEM.as_bytes()).unwrap();
    let key = PKey::private_key_from_pem(EXAMPLE_COM_PEM.as_bytes()).unwrap();

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    builder.set_certificate(&cert).unwrap();
    builder.set_private_key(&key).unwrap();
    builder.set_min_proto_version(Some(min)).unwrap();
    builder.set_max_proto_version(Some(max)).unwrap();
    builder.build()
}

/// Server context that only speaks TLS 1.1, at security level 0
pub fn legacy_acceptor() -> SslAcceptor {
    let cert = X509::from_pem(EXAMPLE_COM_PEM.as_bytes()).unwrap();
    let key = PKey::private_key_from_pem(EXAMPLE_COM_PEM.as_bytes()).unwrap();

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    builder.clear_options(SslOptions::NO_TLSV1 | SslOptions::NO_TLSV1_1);
    builder.set_cipher_list("DEFAULT:@SECLEVEL=0").unwrap();
    builder.set_certificate(&cert).unwrap();
    builder.set_private_key(&key).unwrap();
    builder.set_min_proto_version(Some(SslVersion::TLS1_1)).unwrap();
    builder.set_max_proto_version(Some(SslVersion::TLS1_1)).unwrap();
    builder.build()
}

/// Accept `connections` TCP connections, run the TLS handshake on each and
/// pass successful sessions to `handler`. Joins to the number of completed
/// handshakes.
pub fn tls_server<F>(acceptor: SslAcceptor, connections: usize, handler: F) -> (u16, thread::JoinHandle<usize>)
where
    F: Fn(&mut SslStream<TcpStream>) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let mut handshakes = 0;
        for _ in 0..connections {
            let (tcp, _) = listener.accept().unwrap();
            if let Ok(mut stream) = acceptor.accept(tcp) {
                handshakes += 1;
                handler(&mut stream);
            }
        }
        handshakes
    });

    (port, handle)
}

/// Echo one line back, then close the TLS session cleanly
pub fn echo_line(stream: &mut SslStream<TcpStream>) {
    let mut line = String::new();
    {
        let mut reader = BufReader::new(&mut *stream);
        if reader.read_line(&mut line).is_err() {
            return;
        }
    }
    let _ = stream.write_all(line.as_bytes());
    let _ = stream.flush();
    let _ = stream.shutdown();
}

/// Resolves every host to a fixed address list
pub struct StaticResolver(pub Vec<IpAddr>);

impl StaticResolver {
    pub fn loopback() -> Arc<Self> {
        Arc::new(StaticResolver(vec!["127.0.0.1".parse().unwrap()]))
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, _host: &str) -> tlslink::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

/// Interaction port with a fixed answer that counts certificate prompts
pub struct ScriptedPort {
    pub choice: IssueChoice,
    pub durability: Durability,
    pub prompts: Arc<AtomicUsize>,
}

impl ScriptedPort {
    pub fn new(choice: IssueChoice, durability: Durability) -> (Self, Arc<AtomicUsize>) {
        let prompts = Arc::new(AtomicUsize::new(0));
        let port = ScriptedPort {
            choice,
            durability,
            prompts: Arc::clone(&prompts),
        };
        (port, prompts)
    }
}

impl InteractionPort for ScriptedPort {
    fn present_certificate_issue(&mut self, _issue: &CertificateIssue<'_>) -> IssueChoice {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.choice
    }

    fn choose_durability(&mut self, _host: &str) -> Durability {
        self.durability
    }

    fn confirm_leave_secure(&mut self, _host: &str) -> LeaveChoice {
        LeaveChoice::Continue
    }
}
