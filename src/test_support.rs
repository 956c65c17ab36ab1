//! In-process stand-ins for the server under test, used by unit tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const INDEX_BODY: &str = "<html><head><title>index</title></head><body>stub index</body></html>";

#[derive(Debug, Clone)]
struct StubSettings {
    idle_timeout: Option<Duration>,
    gateway_delay: Duration,
    body_limit: usize,
    sequential: bool,
}

/// Builder for [`StubServer`]
#[derive(Debug, Clone)]
pub struct StubServerBuilder {
    settings: StubSettings,
}

impl StubServerBuilder {
    /// Close connections that make no progress for `idle`
    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.settings.idle_timeout = Some(idle);
        self
    }

    /// Delay before `/cgi-bin/*` answers 504
    pub fn gateway_delay(mut self, delay: Duration) -> Self {
        self.settings.gateway_delay = delay;
        self
    }

    pub fn body_limit(mut self, limit: usize) -> Self {
        self.settings.body_limit = limit;
        self
    }

    /// Serve one connection at a time, blocking the accept loop
    pub fn sequential(mut self) -> Self {
        self.settings.sequential = true;
        self
    }

    pub async fn start(self) -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let settings = Arc::new(self.settings);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, _)) = accepted else { continue };
                let settings = settings.clone();
                if settings.sequential {
                    serve_connection(stream, &settings).await;
                } else {
                    tokio::spawn(async move { serve_connection(stream, &settings).await });
                }
            }
        });
        StubServer { addr, cancel, handle }
    }
}

/// Minimal HTTP/1.1 server with an idle timeout and a gateway-timeout path
pub struct StubServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StubServer {
    pub fn builder() -> StubServerBuilder {
        StubServerBuilder {
            settings: StubSettings {
                idle_timeout: None,
                gateway_delay: Duration::from_millis(300),
                body_limit: 16,
                sequential: false,
            },
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Accepts connections and never reads from or writes to them
pub struct BlackHole {
    handle: JoinHandle<()>,
}

impl Drop for BlackHole {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn black_hole() -> (SocketAddr, BlackHole) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, BlackHole { handle })
}

async fn read_some(stream: &mut TcpStream, buf: &mut [u8], idle: Option<Duration>) -> Option<usize> {
    let read = match idle {
        Some(idle) => timeout(idle, stream.read(buf)).await.ok()?,
        None => stream.read(buf).await,
    };
    match read {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}

async fn write_all(stream: &mut TcpStream, bytes: &[u8], idle: Option<Duration>) -> bool {
    match idle {
        Some(idle) => matches!(timeout(idle, stream.write_all(bytes)).await, Ok(Ok(()))),
        None => stream.write_all(bytes).await.is_ok(),
    }
}

async fn serve_connection(mut stream: TcpStream, settings: &StubSettings) {
    let mut buf = vec![0u8; 8192];
    loop {
        let mut request = Vec::new();
        let head_end = loop {
            if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            let Some(n) = read_some(&mut stream, &mut buf, settings.idle_timeout).await else {
                return;
            };
            request.extend_from_slice(&buf[..n]);
        };

        let head = String::from_utf8_lossy(&request[..head_end]).into_owned();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next().unwrap_or("").split(' ');
        let method = request_line.next().unwrap_or("").to_string();
        let path = request_line.next().unwrap_or("/").to_string();
        let mut content_length = 0usize;
        let mut close = false;
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                } else if name.eq_ignore_ascii_case("connection") && value.trim().eq_ignore_ascii_case("close") {
                    close = true;
                }
            }
        }

        let mut have = request.len() - (head_end + 4);
        while have < content_length {
            let Some(n) = read_some(&mut stream, &mut buf, settings.idle_timeout).await else {
                return;
            };
            have += n;
        }

        let (status, body): (&str, Vec<u8>) = if content_length > settings.body_limit {
            close = true;
            ("413 Payload Too Large", b"too large".to_vec())
        } else {
            route(&method, &path, settings).await
        };

        let mut response = format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            status,
            if path.ends_with(".txt") { "text/plain" } else { "text/html" },
            body.len()
        )
        .into_bytes();
        if method != "HEAD" {
            response.extend_from_slice(&body);
        }
        if !write_all(&mut stream, &response, settings.idle_timeout).await || close {
            return;
        }
    }
}

async fn route(method: &str, path: &str, settings: &StubSettings) -> (&'static str, Vec<u8>) {
    match (method, path) {
        ("GET" | "HEAD", "/" | "/index.html") => ("200 OK", INDEX_BODY.as_bytes().to_vec()),
        ("GET", "/test.txt") => ("200 OK", vec![b'a'; 512 * 1024]),
        ("GET", p) if p.starts_with("/cgi-bin/") => {
            sleep(settings.gateway_delay).await;
            ("504 Gateway Timeout", b"gateway timeout".to_vec())
        }
        ("GET" | "HEAD" | "POST" | "DELETE", _) => ("404 Not Found", b"Custom 404 Page".to_vec()),
        _ => ("405 Method Not Allowed", Vec::new()),
    }
}
