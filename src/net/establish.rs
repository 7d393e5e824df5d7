//! Sequential TCP connection establishment
//!
//! Addresses are tried one after another. Every attempt is bounded by the
//! budget that is still left, and the time charged for an attempt is never
//! more than what remained before it started, so the total charged time is
//! always within the configured budget.

use crate::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One connection attempt
#[derive(Debug, Clone)]
pub struct Attempt {
    pub addr: SocketAddr,
    /// Time charged against the budget
    pub elapsed: Duration,
    /// Low-level error text, `None` for the successful attempt
    pub error: Option<String>,
}

/// A connected stream and the accounting that led to it
#[derive(Debug)]
pub struct Established {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub attempts: Vec<Attempt>,
    /// Sum of all attempts' charged time
    pub elapsed: Duration,
}

/// Connect to the first reachable address within `budget`
///
/// `host` is only used for error reporting.
pub fn establish(host: &str, addresses: &[IpAddr], port: u16, budget: Duration) -> Result<Established> {
    let mut attempts = Vec::with_capacity(addresses.len());
    let mut charged = Duration::ZERO;
    let mut last_error = String::from("no addresses to connect to");

    for ip in addresses {
        let remaining = budget.saturating_sub(charged);
        if remaining.is_zero() {
            last_error = format!("connect timeout budget of {:?} exhausted", budget);
            break;
        }

        let addr = SocketAddr::new(*ip, port);
        let started = Instant::now();
        let result = connect_one(addr, remaining);
        let elapsed = started.elapsed().min(remaining);
        charged += elapsed;

        match result {
            Ok(stream) => {
                debug!(%addr, ?elapsed, "connected");
                attempts.push(Attempt { addr, elapsed, error: None });
                return Ok(Established {
                    stream,
                    peer: addr,
                    attempts,
                    elapsed: charged,
                });
            }
            Err(e) => {
                debug!(%addr, ?elapsed, error = %e, "connect attempt failed");
                last_error = e.to_string();
                attempts.push(Attempt {
                    addr,
                    elapsed,
                    error: Some(last_error.clone()),
                });
            }
        }
    }

    warn!(host, ?charged, error = %last_error, "could not connect");
    Err(Error::ConnectFailed {
        host: host.to_string(),
        detail: last_error,
        elapsed: charged,
    })
}

fn connect_one(addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&addr.into(), timeout)?;
    socket.set_nodelay(true)?;
    Ok(TcpStream::from(socket))
}
