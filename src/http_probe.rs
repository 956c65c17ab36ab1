use super::Result;
use eyre::{eyre, WrapErr};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// A single request description
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Overrides the probe's default timeout
    pub timeout: Option<Duration>,
    /// Overrides the probe's default port
    pub port: Option<u16>,
}

impl ProbeRequest {
    /// Builds a request with an arbitrary, possibly unregistered, method
    pub fn new(method: &str, path: impl Into<String>) -> Result<Self> {
        let method = Method::from_bytes(method.as_bytes()).map_err(|e| eyre!("invalid method {:?}: {}", method, e))?;
        Ok(Self::with_method(method, path))
    }

    fn with_method(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            port: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::with_method(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::with_method(Method::HEAD, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::with_method(Method::POST, path).body(body)
    }

    pub fn put(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::with_method(Method::PUT, path).body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::with_method(Method::DELETE, path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// A fully read response
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Wall-clock time from send to the last body byte
    pub elapsed: Duration,
}

impl ProbeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a repeatable header such as `Set-Cookie`
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

/// Outcome of a request where failure to get a response is an expected result
#[derive(Debug)]
pub enum ProbeOutcome {
    Response(ProbeResponse),
    /// The client-side timeout fired first
    TimedOut(Duration),
    /// Connection refused, reset mid-response, malformed reply
    Transport(String),
}

/// Structured HTTP client pointed at one server instance.
///
/// Connections are never pooled, so every request travels on a fresh
/// connection like the raw-socket scenarios do.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    base: SocketAddr,
    default_timeout: Duration,
}

impl HttpProbe {
    /// Creates a probe for `base`
    ///
    /// # Arguments
    /// * `base` - Host and default port of the server
    /// * `default_timeout` - Timeout for requests that do not set their own
    ///
    /// # Returns
    /// * `Result<Self>` - The probe or a client construction error
    pub fn new(base: SocketAddr, default_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(2))
            .build()
            .wrap_err("failed to build HTTP client")?;
        Ok(Self {
            client,
            base,
            default_timeout,
        })
    }

    pub fn base(&self) -> SocketAddr {
        self.base
    }

    pub fn url(&self, request: &ProbeRequest) -> String {
        let port = request.port.unwrap_or(self.base.port());
        format!("http://{}:{}{}", self.base.ip(), port, request.path)
    }

    /// Sends `request` and reads the whole body; transport failures are errors
    pub async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse> {
        let label = format!("{} {}", request.method, self.url(&request));
        match self.try_send(request).await {
            ProbeOutcome::Response(response) => Ok(response),
            ProbeOutcome::TimedOut(after) => Err(eyre!("{} timed out after {:?}", label, after)),
            ProbeOutcome::Transport(detail) => Err(eyre!("{} failed: {}", label, detail)),
        }
    }

    /// Sends `request`, reporting timeouts and transport failures as values
    pub async fn try_send(&self, request: ProbeRequest) -> ProbeOutcome {
        let url = self.url(&request);
        let limit = request.timeout.unwrap_or(self.default_timeout);
        let mut builder = self.client.request(request.method.clone(), &url).timeout(limit);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let started = Instant::now();
        let result = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        }
        .await;
        let elapsed = started.elapsed();

        match result {
            Ok((status, headers, body)) => {
                debug!("{} {} -> {} in {:?}", request.method, url, status, elapsed);
                ProbeOutcome::Response(ProbeResponse {
                    status,
                    headers,
                    body: body.to_vec(),
                    elapsed,
                })
            }
            Err(e) if e.is_timeout() => {
                debug!("{} {} timed out after {:?}", request.method, url, elapsed);
                ProbeOutcome::TimedOut(elapsed)
            }
            Err(e) => {
                debug!("{} {} transport failure: {}", request.method, url, e);
                ProbeOutcome::Transport(e.to_string())
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<ProbeResponse> {
        self.send(ProbeRequest::get(path)).await
    }

    pub async fn head(&self, path: &str) -> Result<ProbeResponse> {
        self.send(ProbeRequest::head(path)).await
    }

    pub async fn post(&self, path: &str, body: impl Into<Vec<u8>>) -> Result<ProbeResponse> {
        self.send(ProbeRequest::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: impl Into<Vec<u8>>) -> Result<ProbeResponse> {
        self.send(ProbeRequest::put(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ProbeResponse> {
        self.send(ProbeRequest::delete(path)).await
    }
}
