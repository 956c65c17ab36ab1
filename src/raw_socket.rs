use super::Result;
use crate::errors::HarnessError;
use reqwest::StatusCode;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Result of a bounded receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Bytes arrived before the deadline
    Data(Vec<u8>),
    /// The peer closed its side (orderly FIN)
    Closed,
    /// The connection was reset or otherwise broke
    Reset,
    /// Nothing arrived before the deadline
    TimedOut,
}

impl RecvOutcome {
    pub fn is_data(&self) -> bool {
        matches!(self, RecvOutcome::Data(_))
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            RecvOutcome::Data(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Result of a raw write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte was handed to the kernel
    Sent(usize),
    /// The socket refused the write (reset, broken pipe, already closed)
    Failed(ErrorKind),
    /// The write did not complete before the deadline; the peer stopped reading
    Stalled,
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent(_))
    }
}

/// Local view of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// One direction is finished: we shut down writing or the peer sent FIN
    HalfClosed,
    Closed,
}

/// What became of a stalled connection after the wait.
///
/// Both variants are acceptable outcomes of a stall scenario; scenarios
/// assert server liveness separately instead of tightening this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallFate {
    /// The follow-up write or read failed: the server closed or reset us
    PeerClosed,
    /// The socket still accepts writes; `late_status` is set if the server
    /// still produced a response on it
    LeftOpen { late_status: Option<u16> },
}

/// Opens raw TCP connections without any HTTP framing.
#[derive(Debug, Clone)]
pub struct RawSocketDriver {
    /// Bound on the TCP handshake
    pub connect_timeout: Duration,
    /// Bound on a single `send_raw`
    pub write_timeout: Duration,
}

impl Default for RawSocketDriver {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl RawSocketDriver {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Default::default()
        }
    }

    /// Establishes a TCP connection.
    ///
    /// # Arguments
    /// * `addr` - Server address
    ///
    /// # Returns
    /// * `Result<Connection>` - Open connection or [`HarnessError::Connect`]
    pub async fn open(&self, addr: SocketAddr) -> Result<Connection> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(HarnessError::Connect { addr, source }.into()),
            Err(_) => {
                return Err(HarnessError::Connect {
                    addr,
                    source: std::io::Error::new(ErrorKind::TimedOut, "connect timed out"),
                }
                .into())
            }
        };
        stream.set_nodelay(true)?;
        Ok(Connection::new(stream, addr, self.write_timeout))
    }

    /// Opens a connection whose kernel receive buffer is shrunk before the
    /// handshake, so a client that stops reading quickly back-pressures the
    /// server's writes.
    ///
    /// # Arguments
    /// * `addr` - Server address
    /// * `recv_buffer` - Requested `SO_RCVBUF` size in bytes
    ///
    /// # Returns
    /// * `Result<Connection>` - Open connection or [`HarnessError::Connect`]
    pub async fn open_with_recv_buffer(&self, addr: SocketAddr, recv_buffer: usize) -> Result<Connection> {
        let connect_timeout = self.connect_timeout;
        let std_stream = tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
            // Must happen before connect so the advertised window is small
            socket.set_recv_buffer_size(recv_buffer)?;
            socket.connect_timeout(&addr.into(), connect_timeout)?;
            socket.set_nonblocking(true)?;
            Ok(socket.into())
        })
        .await?
        .map_err(|source| HarnessError::Connect { addr, source })?;

        let stream = TcpStream::from_std(std_stream)?;
        stream.set_nodelay(true)?;
        debug!("Opened {} with SO_RCVBUF {}", addr, recv_buffer);
        Ok(Connection::new(stream, addr, self.write_timeout))
    }
}

/// One raw TCP connection.
///
/// Every method is safe to call in any state; operations on a closed
/// connection report failure values instead of erroring.
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub peer: SocketAddr,
    pub opened_at: Instant,
    stream: Option<TcpStream>,
    state: ConnState,
    bytes_sent: usize,
    bytes_received: usize,
    write_timeout: Duration,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, write_timeout: Duration) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("conn#{} open to {}", id, peer);
        Self {
            id,
            peer,
            opened_at: Instant::now(),
            stream: Some(stream),
            state: ConnState::Open,
            bytes_sent: 0,
            bytes_received: 0,
            write_timeout,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Writes `bytes` verbatim, bounded by the driver's write timeout
    pub async fn send_raw(&mut self, bytes: &[u8]) -> SendOutcome {
        let Some(stream) = self.stream.as_mut() else {
            return SendOutcome::Failed(ErrorKind::NotConnected);
        };
        match timeout(self.write_timeout, stream.write_all(bytes)).await {
            Ok(Ok(())) => {
                self.bytes_sent += bytes.len();
                trace!("conn#{} sent {} bytes", self.id, bytes.len());
                SendOutcome::Sent(bytes.len())
            }
            Ok(Err(e)) => {
                debug!("conn#{} send failed: {}", self.id, e);
                self.state = ConnState::Closed;
                SendOutcome::Failed(e.kind())
            }
            Err(_) => {
                debug!("conn#{} send stalled for {:?}", self.id, self.write_timeout);
                SendOutcome::Stalled
            }
        }
    }

    /// Reads at most `max_bytes`, returning as soon as anything arrives.
    ///
    /// Never blocks past `deadline`.
    pub async fn recv_with_deadline(&mut self, max_bytes: usize, deadline: Duration) -> RecvOutcome {
        let Some(stream) = self.stream.as_mut() else {
            return RecvOutcome::Closed;
        };
        let mut buf = vec![0u8; max_bytes.max(1)];
        match timeout(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                debug!("conn#{} closed by peer", self.id);
                self.state = ConnState::HalfClosed;
                RecvOutcome::Closed
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                self.bytes_received += n;
                trace!("conn#{} received {} bytes", self.id, n);
                RecvOutcome::Data(buf)
            }
            Ok(Err(e)) => {
                debug!("conn#{} receive failed: {}", self.id, e);
                self.state = ConnState::Closed;
                RecvOutcome::Reset
            }
            Err(_) => RecvOutcome::TimedOut,
        }
    }

    /// Accumulates bytes until the response head (`\r\n\r\n`) is complete.
    ///
    /// Returns whatever arrived if the peer closes first. The deadline bounds
    /// the whole read, not each chunk.
    pub async fn read_response_head(&mut self, deadline: Duration) -> RecvOutcome {
        let started = Instant::now();
        let mut collected = Vec::new();
        loop {
            if find_head_end(&collected).is_some() {
                return RecvOutcome::Data(collected);
            }
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return partial_or(collected, RecvOutcome::TimedOut);
            }
            match self.recv_with_deadline(8192, remaining).await {
                RecvOutcome::Data(chunk) => collected.extend_from_slice(&chunk),
                other => return partial_or(collected, other),
            }
        }
    }

    /// Reads until the peer closes or `deadline` passes, keeping at most `limit` bytes
    pub async fn drain(&mut self, limit: usize, deadline: Duration) -> (Vec<u8>, RecvOutcome) {
        let started = Instant::now();
        let mut collected = Vec::new();
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return (collected, RecvOutcome::TimedOut);
            }
            match self.recv_with_deadline(16 * 1024, remaining).await {
                RecvOutcome::Data(chunk) => {
                    let room = limit.saturating_sub(collected.len());
                    collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                terminal => return (collected, terminal),
            }
        }
    }

    /// Sends `follow_up` on a stalled connection and classifies the result
    pub async fn classify_stall(&mut self, follow_up: &[u8], deadline: Duration) -> StallFate {
        match self.send_raw(follow_up).await {
            SendOutcome::Sent(_) => {}
            SendOutcome::Failed(_) => return StallFate::PeerClosed,
            SendOutcome::Stalled => return StallFate::LeftOpen { late_status: None },
        }
        let fate = match self.read_response_head(deadline).await {
            RecvOutcome::Data(bytes) => StallFate::LeftOpen {
                late_status: parse_response_head(&bytes).map(|head| head.status.as_u16()),
            },
            RecvOutcome::Closed | RecvOutcome::Reset => StallFate::PeerClosed,
            RecvOutcome::TimedOut => StallFate::LeftOpen { late_status: None },
        };
        debug!("conn#{} stall fate after {:?}: {:?}", self.id, self.age(), fate);
        fate
    }

    /// Shuts down our sending side
    pub async fn shutdown_write(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
            if self.state == ConnState::Open {
                self.state = ConnState::HalfClosed;
            }
        }
    }

    /// Closes the socket with an RST instead of a FIN
    pub fn abort(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = SockRef::from(&stream).set_linger(Some(Duration::ZERO));
            drop(stream);
            debug!("conn#{} aborted", self.id);
        }
        self.state = ConnState::Closed;
    }

    /// Closes the connection; a no-op when already closed
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            debug!(
                "conn#{} closed after {:?} ({} sent, {} received)",
                self.id,
                self.age(),
                self.bytes_sent,
                self.bytes_received
            );
        }
        self.state = ConnState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parsed status line and headers of a raw response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// Offset of the first body byte in the buffer that was parsed
    pub body_offset: usize,
}

impl ResponseHead {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

/// Parses `HTTP/x.y NNN reason` plus headers from the start of `bytes`.
///
/// Returns `None` until the full head is present or if it is malformed.
pub fn parse_response_head(bytes: &[u8]) -> Option<ResponseHead> {
    let end = find_head_end(bytes)?;
    let text = std::str::from_utf8(&bytes[..end]).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_bytes(parts.next()?.as_bytes()).ok()?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Some(ResponseHead {
        version: version.to_string(),
        status,
        reason,
        headers,
        body_offset: end + 4,
    })
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

fn partial_or(collected: Vec<u8>, outcome: RecvOutcome) -> RecvOutcome {
    if collected.is_empty() {
        outcome
    } else {
        RecvOutcome::Data(collected)
    }
}
