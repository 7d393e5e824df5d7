//! Blocking I/O channel over a plain or encrypted transport
//!
//! [`Transport`] abstracts the byte stream (plain TCP or TLS) so that the
//! channel code is the same for both. [`IoChannel`] adds an internal read
//! buffer, readiness waits bounded by the read timeout, line reading and
//! eager flushing of writes.

use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use openssl::ssl::{ShutdownState, SslStream};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Byte stream underneath an [`IoChannel`]
pub trait Transport: Send {
    /// Wait until the transport is ready; `None` waits forever
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Switch the underlying socket between blocking and non-blocking reads
    fn set_nonblocking(&mut self, _nonblocking: bool) -> io::Result<()> {
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Whether traffic is currently encrypted
    fn is_encrypted(&self) -> bool;

    /// Give back the plain socket, for an in-place TLS upgrade
    fn into_tcp(self: Box<Self>) -> Option<TcpStream> {
        None
    }
}

/// Wait for `events` on a raw descriptor
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    // -1 = infinite
    let timeout_ms = timeout
        .map(|d| i32::try_from(d.as_millis()).unwrap_or(i32::MAX))
        .unwrap_or(-1);

    loop {
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result >= 0 {
            return Ok(result > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }
}

/// Unencrypted TCP transport
#[derive(Debug)]
pub struct PlainTransport {
    stream: TcpStream,
}

impl PlainTransport {
    pub fn new(stream: TcpStream) -> Self {
        PlainTransport { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for PlainTransport {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }

    fn is_encrypted(&self) -> bool {
        false
    }

    fn into_tcp(self: Box<Self>) -> Option<TcpStream> {
        Some(self.stream)
    }
}

/// TLS transport over an established [`SslStream`]
pub struct TlsTransport {
    stream: SslStream<TcpStream>,
    failed: bool,
    close_received: bool,
}

impl TlsTransport {
    pub fn new(stream: SslStream<TcpStream>) -> Self {
        TlsTransport {
            stream,
            failed: false,
            close_received: false,
        }
    }

    pub fn stream(&self) -> &SslStream<TcpStream> {
        &self.stream
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("version", &self.stream.ssl().version_str())
            .field("failed", &self.failed)
            .field("close_received", &self.close_received)
            .finish()
    }
}

impl Transport for TlsTransport {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        // Decrypted bytes already held by OpenSSL do not show up on the socket
        if events != PollEvents::Write && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => {
                if self.stream.get_shutdown().contains(ShutdownState::RECEIVED) {
                    self.close_received = true;
                }
                Ok(0)
            }
            Ok(n) => Ok(n),
            // Partial record on a non-blocking socket
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.stream.get_ref().set_nonblocking(nonblocking)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf).map_err(|e| {
            self.failed = true;
            e
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            e
        })
    }

    fn close(&mut self) -> Result<()> {
        if !self.failed && !self.close_received {
            if let Err(e) = self.stream.shutdown() {
                debug!(error = %e, "TLS close_notify not sent");
            }
        }
        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }

    fn is_encrypted(&self) -> bool {
        !self.failed && !self.close_received
    }
}

/// Buffered blocking reader/writer used by a connection
pub struct IoChannel {
    transport: Option<Box<dyn Transport>>,
    buffer: BytesMut,
    blocking: bool,
    read_timeout: Duration,
    expect_encrypted: bool,
}

impl std::fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoChannel")
            .field("connected", &self.is_connected())
            .field("buffered", &self.buffer.len())
            .field("blocking", &self.blocking)
            .field("read_timeout", &self.read_timeout)
            .field("expect_encrypted", &self.expect_encrypted)
            .finish()
    }
}

impl Default for IoChannel {
    fn default() -> Self {
        IoChannel::disconnected()
    }
}

impl IoChannel {
    pub fn new(transport: Box<dyn Transport>, blocking: bool, read_timeout: Duration) -> Self {
        let expect_encrypted = transport.is_encrypted();
        IoChannel {
            transport: Some(transport),
            buffer: BytesMut::with_capacity(READ_CHUNK),
            blocking,
            read_timeout,
            expect_encrypted,
        }
    }

    /// A channel with no transport; every operation fails with `NotConnected`
    pub fn disconnected() -> Self {
        IoChannel {
            transport: None,
            buffer: BytesMut::new(),
            blocking: false,
            read_timeout: Duration::from_secs(crate::net::DEFAULT_READ_TIMEOUT_SECS),
            expect_encrypted: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Whether the channel was set up encrypted and still is
    pub fn is_encrypted(&self) -> bool {
        self.expect_encrypted && self.transport.as_ref().map(|t| t.is_encrypted()).unwrap_or(false)
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Bytes read from the transport but not yet consumed
    pub fn bytes_available(&self) -> usize {
        self.buffer.len()
    }

    /// Write the whole buffer and flush it
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;

        let mut written = 0;
        let mut failure = None;
        while written < buf.len() {
            match transport.write(&buf[written..]) {
                Ok(0) => {
                    failure = Some(Error::ConnectionClosed);
                    break;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    failure = Some(Error::Io(e));
                    break;
                }
            }
        }
        if failure.is_none() {
            if let Err(e) = transport.flush() {
                failure = Some(Error::Io(e));
            }
        }

        match failure {
            None => Ok(written),
            Some(e) => {
                warn!(error = %e, "write failed, dropping connection");
                self.drop_transport();
                Err(e)
            }
        }
    }

    /// Read whatever is available, waiting per the blocking mode
    ///
    /// `Ok(0)` means nothing arrived before the read timeout.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if self.buffer.is_empty() && !self.fill_within(self.wait_timeout())? {
            return Ok(0);
        }

        Ok(self.take_into(buf, buf.len()))
    }

    /// Read up to and including the next `\n`, or until `buf` is full
    ///
    /// Keeps waiting while the peer stays connected; a drop mid-line is an
    /// error and the partial line is discarded.
    pub fn read_line(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let n = (pos + 1).min(buf.len());
                return Ok(self.take_into(buf, n));
            }
            if self.buffer.len() >= buf.len() {
                return Ok(self.take_into(buf, buf.len()));
            }

            if let Err(e) = self.fill_within(self.wait_timeout()) {
                self.buffer.clear();
                return Err(e);
            }
        }
    }

    /// Wait up to `timeout` for incoming data
    ///
    /// Data is pulled into the buffer, so TLS records that carry no
    /// application bytes do not count as a response.
    pub fn wait_for_response(&mut self, timeout: Duration) -> Result<bool> {
        if !self.buffer.is_empty() {
            return Ok(true);
        }
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.fill_within(Some(timeout))
    }

    /// Non-blocking liveness check
    ///
    /// Readable input is drained into the buffer to tell data from EOF.
    pub fn is_connection_valid(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        if !self.buffer.is_empty() {
            return true;
        }
        self.fill_within(Some(Duration::ZERO)).is_ok()
    }

    /// True when nothing is buffered and nothing more can be read right now
    pub fn at_end(&mut self) -> bool {
        if !self.buffer.is_empty() {
            return false;
        }
        if !self.is_connected() {
            return true;
        }
        !matches!(self.fill_within(Some(Duration::ZERO)), Ok(true))
    }

    /// Close the transport and discard buffered data
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                debug!(error = %e, "error while closing transport");
            }
        }
        self.buffer.clear();
    }

    /// Take the transport out, leaving the channel disconnected
    ///
    /// Fails when unread data is buffered, since it would be lost.
    pub fn take_transport(&mut self) -> Result<Box<dyn Transport>> {
        if !self.buffer.is_empty() {
            return Err(Error::InvalidState(format!(
                "{} unread bytes buffered",
                self.buffer.len()
            )));
        }
        self.transport.take().ok_or(Error::NotConnected)
    }

    fn wait_timeout(&self) -> Option<Duration> {
        if self.blocking {
            None
        } else {
            Some(self.read_timeout)
        }
    }

    fn wait_readable(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let transport = self.transport.as_ref().ok_or(Error::NotConnected)?;
        match transport.poll(PollEvents::Read, timeout) {
            Ok(ready) => Ok(ready),
            Err(e) => {
                self.drop_transport();
                Err(e)
            }
        }
    }

    /// Buffer incoming data, waiting at most `timeout` (`None` waits forever)
    ///
    /// Returns false when the deadline passed with nothing buffered. A
    /// readable socket does not guarantee application data under TLS, so
    /// readiness is re-checked until bytes arrive or time runs out.
    fn fill_within(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if self.wait_readable(remaining)? && self.fill()? > 0 {
                return Ok(true);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(false);
                }
            }
        }
    }

    /// Read one chunk from the transport without blocking
    ///
    /// `Ok(0)` means nothing was available yet; end of stream is an error.
    fn fill(&mut self) -> Result<usize> {
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;

        let mut chunk = [0u8; READ_CHUNK];
        let result = transport.set_nonblocking(true).and_then(|()| {
            let read = loop {
                match transport.read(&mut chunk) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            };
            transport.set_nonblocking(false)?;
            read
        });

        match result {
            Ok(0) => {
                let error = if self.expect_encrypted && !transport.is_encrypted() {
                    Error::EncryptionLost
                } else {
                    Error::ConnectionClosed
                };
                debug!(error = %error, "peer ended the connection");
                self.drop_transport();
                Err(error)
            }
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.drop_transport();
                Err(Error::Io(e))
            }
        }
    }

    fn take_into(&mut self, buf: &mut [u8], n: usize) -> usize {
        let n = n.min(self.buffer.len()).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        n
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                debug!(error = %e, "error while closing failed transport");
            }
        }
    }
}
