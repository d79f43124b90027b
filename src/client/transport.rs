//! Transport adapter
//!
//! The session engine never talks to the network directly. It hands a
//! [`HttpRequest`] to a [`Transport`] and gets back a status code and a body
//! stream. [`HttpTransport`] is the production implementation on top of
//! `reqwest`'s blocking client; tests and embedded servers plug in their
//! own.

use crate::codec::WireParams;
use crate::error::{FilegateError, Result};
use crate::transfer::ChunkReader;
use reqwest::blocking::multipart::{Form, Part};
use std::fmt;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Binary part of a multipart upload
pub struct FilePart {
    /// File name reported in the part headers
    pub file_name: String,
    /// Exact number of bytes `content` yields
    pub length: u64,
    /// Part content
    pub content: ChunkReader,
}

impl fmt::Debug for FilePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePart")
            .field("file_name", &self.file_name)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Request body
#[derive(Debug)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded` parameters
    Form(WireParams),
    /// `multipart/form-data` text fields plus one binary part
    Multipart {
        /// Text fields
        fields: WireParams,
        /// Binary part, sent under the `file` field name
        file: FilePart,
    },
}

/// A request handed to the transport
#[derive(Debug)]
pub struct HttpRequest {
    /// Target URL
    pub url: Url,
    /// Body
    pub body: RequestBody,
    /// Whether the transport may replay the request
    pub idempotent: bool,
}

/// What the transport returns
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Body stream
    pub body: Box<dyn Read + Send>,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Executes requests for one session
///
/// A transport is owned by exactly one session. Sessions that need to run
/// concurrently each get their own handle through [`Transport::duplicate`].
pub trait Transport: Send {
    /// Execute a request
    fn execute(&mut self, request: HttpRequest) -> Result<HttpResponse>;

    /// Independent handle with the same configuration
    fn duplicate(&self) -> Result<Box<dyn Transport>>;
}

/// Proxy settings
#[derive(Clone, Default)]
pub struct ProxyConfig {
    /// Proxy URL, e.g. `http://proxy:3128`
    pub url: String,
    /// Proxy user
    pub username: Option<String>,
    /// Proxy password
    pub password: Option<String>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout, `None` for no limit
    pub read_timeout: Option<Duration>,
    /// Optional proxy
    pub proxy: Option<ProxyConfig>,
    /// Extra attempts for idempotent requests that failed to connect
    pub max_retries: u32,
    /// Pause before the first retry, doubled on each further one
    pub retry_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: None,
            proxy: None,
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// HTTP(S) transport backed by `reqwest`
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    config: TransportConfig,
}

impl HttpTransport {
    /// Build a transport
    pub fn new(config: TransportConfig) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .user_agent(concat!("filegate/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy) = &config.proxy {
            let mut target = reqwest::Proxy::all(&proxy.url)
                .map_err(|e| FilegateError::config(format!("invalid proxy '{}': {}", proxy.url, e)))?;
            if let Some(user) = &proxy.username {
                target = target.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
            }
            builder = builder.proxy(target);
        }

        let client = builder
            .build()
            .map_err(|e| FilegateError::config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Transport configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn send(&self, url: &Url, body: RequestBody) -> std::result::Result<HttpResponse, reqwest::Error> {
        let request = self.client.post(url.clone());
        let request = match body {
            RequestBody::Form(params) => request.form(&params),
            RequestBody::Multipart { fields, file } => {
                let mut form = Form::new();
                for (name, value) in fields {
                    form = form.text(name, value);
                }
                let part = Part::reader_with_length(file.content, file.length)
                    .file_name(file.file_name)
                    .mime_str("application/octet-stream")?;
                request.multipart(form.part(crate::protocol::param::FILE, part))
            }
        };

        let response = request.send()?;
        Ok(HttpResponse {
            status: response.status().as_u16(),
            body: Box::new(response),
        })
    }
}

impl Transport for HttpTransport {
    fn execute(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest {
            url,
            body,
            idempotent,
        } = request;

        let params = match body {
            RequestBody::Form(params) if idempotent => params,
            body => {
                return self
                    .send(&url, body)
                    .map_err(|e| FilegateError::connection(url.as_str(), e.to_string()))
            }
        };

        let mut attempt = 0;
        loop {
            match self.send(&url, RequestBody::Form(params.clone())) {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.config.max_retries && (e.is_connect() || e.is_timeout()) => {
                    let pause = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        "Request to {} failed ({}), retry {}/{} in {:?}",
                        url, e, attempt, self.config.max_retries, pause
                    );
                    std::thread::sleep(pause);
                }
                Err(e) => {
                    debug!("Request to {} failed after {} attempt(s)", url, attempt + 1);
                    return Err(FilegateError::connection(url.as_str(), e.to_string()));
                }
            }
        }
    }

    fn duplicate(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(HttpTransport::new(self.config.clone())?))
    }
}
