// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bus adapter: subscriber sockets the ingest loop drains, plus the
//! publish side for encode-index events.
//!
//! The transport contract is small: every subscription exposes an OS
//! file descriptor for level-triggered readiness polling and a
//! non-blocking `try_recv` that yields one complete message at a time.
//! Frames on the wire are `u32` little-endian length-delimited.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Ceiling for the reconnect back-off between attempts.
pub const RECONNECT_IVL_MAX: Duration = Duration::from_millis(500);

const RECONNECT_IVL_START: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// One subscription on the bus, as consumed by the ingest loop.
pub trait BusSocket: Send {
    /// File descriptor for readiness polling; `None` while disconnected.
    fn poll_fd(&self) -> Option<RawFd>;

    /// Drain one message. `Ok(None)` means "would block"; the socket
    /// reconnects internally (with capped back-off) after a failure.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// TCP subscriber with capped exponential reconnect back-off.
pub struct TcpSubscriber {
    addr: String,
    stream: Option<TcpStream>,
    rx: Vec<u8>,
    backoff: Duration,
    next_attempt: Instant,
}

impl TcpSubscriber {
    /// Lazily-connecting subscriber; the first connect attempt happens on
    /// the first `try_recv`.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            rx: Vec::new(),
            backoff: RECONNECT_IVL_START,
            next_attempt: Instant::now(),
        }
    }

    fn ensure_connected(&mut self) {
        if self.stream.is_some() || Instant::now() < self.next_attempt {
            return;
        }
        match self.try_connect() {
            Ok(stream) => {
                debug!("connected to {}", self.addr);
                self.stream = Some(stream);
                self.rx.clear();
                self.backoff = RECONNECT_IVL_START;
            }
            Err(e) => {
                debug!("connect to {} failed: {}", self.addr, e);
                self.next_attempt = Instant::now() + self.backoff;
                self.backoff = (self.backoff * 2).min(RECONNECT_IVL_MAX);
            }
        }
    }

    fn try_connect(&self) -> Result<TcpStream> {
        let addr = self
            .addr
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {}", self.addr))?
            .next()
            .with_context(|| format!("no address for {}", self.addr))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn disconnect(&mut self, why: &str) {
        debug!("{}: disconnected ({})", self.addr, why);
        self.stream = None;
        self.rx.clear();
        self.next_attempt = Instant::now() + self.backoff;
        self.backoff = (self.backoff * 2).min(RECONNECT_IVL_MAX);
    }
}

/// Pop one complete length-delimited frame off a receive buffer.
fn pop_frame(rx: &mut Vec<u8>) -> Option<Vec<u8>> {
    if rx.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(rx[..4].try_into().unwrap()) as usize;
    if rx.len() < 4 + len {
        return None;
    }
    let frame = rx[4..4 + len].to_vec();
    rx.drain(..4 + len);
    Some(frame)
}

impl BusSocket for TcpSubscriber {
    fn poll_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        self.ensure_connected();

        if let Some(frame) = pop_frame(&mut self.rx) {
            return Ok(Some(frame));
        }

        let mut chunk = [0u8; 16 * 1024];
        loop {
            let read = match self.stream.as_mut() {
                Some(stream) => stream.read(&mut chunk),
                None => return Ok(None),
            };
            match read {
                Ok(0) => {
                    self.disconnect("peer closed");
                    return Ok(None);
                }
                Ok(n) => {
                    self.rx.extend_from_slice(&chunk[..n]);
                    if let Some(frame) = pop_frame(&mut self.rx) {
                        return Ok(Some(frame));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(pop_frame(&mut self.rx)),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.disconnect(&e.to_string());
                    return Ok(None);
                }
            }
        }
    }
}

/// Level-triggered readiness over the subscription fds, waiting up to
/// `timeout_ms`. Entries without a descriptor report not-ready.
pub fn poll_readable(fds: &[Option<RawFd>], timeout_ms: i32) -> Vec<bool> {
    let mut pollfds: Vec<libc::pollfd> = Vec::new();
    let mut index: Vec<usize> = Vec::new();
    for (i, fd) in fds.iter().enumerate() {
        if let Some(fd) = fd {
            pollfds.push(libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            });
            index.push(i);
        }
    }

    let mut ready = vec![false; fds.len()];
    if pollfds.is_empty() {
        std::thread::sleep(Duration::from_millis(timeout_ms.max(0) as u64));
        return ready;
    }

    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc > 0 {
        for (slot, pfd) in index.iter().zip(pollfds.iter()) {
            ready[*slot] = pfd.revents != 0;
        }
    }
    ready
}

/// Lossy fan-out publisher for encode-index events (and the optional raw
/// bitstream). Subscribers connect over TCP; a subscriber that cannot keep
/// up is dropped rather than back-pressuring the encoder.
pub struct IndexPublisher {
    listener: TcpListener,
    clients: Vec<TcpStream>,
}

impl IndexPublisher {
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("failed to bind publish port {port}"))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            clients: Vec::new(),
        })
    }

    /// Bind an OS-assigned port (tests).
    pub fn bind_ephemeral() -> Result<(Self, u16)> {
        let publisher = Self::bind(0)?;
        let port = publisher.listener.local_addr()?.port();
        Ok((publisher, port))
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("index subscriber connected from {}", peer);
                    if stream.set_nonblocking(true).is_ok() && stream.set_nodelay(true).is_ok() {
                        self.clients.push(stream);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Broadcast one length-delimited frame to every connected subscriber.
    pub fn publish(&mut self, data: &Bytes) {
        self.accept_pending();
        let len = (data.len() as u32).to_le_bytes();
        self.clients.retain_mut(|client| {
            let sent = client.write_all(&len).and_then(|_| client.write_all(data));
            match sent {
                Ok(()) => true,
                Err(e) => {
                    debug!("dropping index subscriber: {}", e);
                    false
                }
            }
        });
    }
}

/// Read one length-delimited frame from a blocking stream. Subscriber-side
/// helper for index consumers and tests.
pub fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let mut frame = vec![0u8; u32::from_le_bytes(len) as usize];
    stream.read_exact(&mut frame)?;
    Ok(frame)
}

/// Write one length-delimited frame. Producer-side helper for tests and
/// tooling standing in for the upstream processes.
pub fn write_frame<W: Write>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    w.write_all(&(data.len() as u32).to_le_bytes())?;
    w.write_all(data)
}
