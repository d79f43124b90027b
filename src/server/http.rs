//! HTTP listener
//!
//! A small blocking HTTP/1.1 front end for the [`Dispatcher`]: one thread
//! per connection, one request per connection. Parameters are read from the
//! query string and from either a form-urlencoded or a multipart body.
//!
//! ```bash
//! filegate serve --config server.json
//! ```

use crate::error::{FilegateError, Result};
use crate::protocol::DEFAULT_CHUNK_LENGTH;
use crate::server::multipart::{boundary_of, read_multipart, MultipartLimits};
use crate::server::{Dispatcher, Reply, ServerRequest};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MAX_HEADER_LINES: usize = 100;
const MAX_LINE: u64 = 16 * 1024;

/// Listener configuration
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Bind address
    pub bind: SocketAddr,
    /// Maximum size of the text parameters of one request
    pub max_form_size: usize,
    /// Maximum size of the binary part of one upload request
    pub max_upload_size: u64,
    /// Socket read timeout
    pub read_timeout: Duration,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_form_size: 2 * 1024 * 1024,
            max_upload_size: DEFAULT_CHUNK_LENGTH + 1024 * 1024,
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Blocking HTTP server
pub struct HttpServer {
    config: HttpServerConfig,
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<AtomicBool>,
}

impl HttpServer {
    /// Bind the listening socket
    pub fn bind(config: HttpServerConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let addr = config.bind.to_string();
        let listener =
            TcpListener::bind(config.bind).map_err(|e| FilegateError::connection(&addr, e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| FilegateError::connection(&addr, e.to_string()))?;

        Ok(Self {
            config,
            listener,
            dispatcher,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Actual bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get shutdown flag for external control
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run the server (blocking)
    pub fn run(&self) -> Result<()> {
        info!("Filegate listening on http://{}", self.local_addr()?);

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let config = self.config.clone();

                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, peer, &dispatcher, &config) {
                            warn!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }

        info!("Filegate server shutting down");
        Ok(())
    }
}

/// Handle a single HTTP connection
fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    config: &HttpServerConfig,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(config.read_timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let request_line = read_line(&mut reader)?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return send_error(&mut stream, 400, "Bad Request");
    }
    let method = parts[0].to_ascii_uppercase();
    let target = parts[1].to_string();

    let mut head = RequestHead::default();
    for _ in 0..MAX_HEADER_LINES {
        let line = read_line(&mut reader)?;
        if line.is_empty() {
            head.complete = true;
            break;
        }
        head.push(&line);
    }
    if !head.complete {
        return send_error(&mut stream, 431, "Request Header Fields Too Large");
    }
    if method != "GET" && method != "POST" {
        return send_error(&mut stream, 405, "Method Not Allowed");
    }
    if head.expect_continue {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    }

    let mut params = match target.split_once('?') {
        Some((_, query)) => parse_form(query.as_bytes()),
        None => Vec::new(),
    };

    let body: Box<dyn Read + Send + '_> = if head.chunked {
        Box::new(ChunkedReader::new(&mut reader))
    } else {
        Box::new((&mut reader).take(head.content_length))
    };

    let mut upload = None;
    match head.content_type.as_deref().and_then(boundary_of) {
        Some(boundary) => {
            let limits = MultipartLimits {
                max_fields: config.max_form_size as u64,
                max_file: config.max_upload_size,
            };
            let admit = |fields: &[(String, String)]| {
                let seen: Vec<(String, String)> = params.iter().chain(fields).cloned().collect();
                dispatcher.authorize_upload(&seen, peer.ip())
            };
            let form = match read_multipart(body, &boundary, limits, admit) {
                Ok(form) => form,
                Err(e) => {
                    debug!("Rejected multipart body from {}: {}", peer, e);
                    return send_error(&mut stream, 400, "Bad Request");
                }
            };
            params.extend(form.fields);
            upload = form.file;
        }
        None if method == "POST" => {
            let mut raw = Vec::new();
            body.take(config.max_form_size as u64 + 1).read_to_end(&mut raw)?;
            if raw.len() > config.max_form_size {
                return send_error(&mut stream, 413, "Payload Too Large");
            }
            params.extend(parse_form(&raw));
        }
        None => {}
    }

    let reply = dispatcher.dispatch(ServerRequest {
        params,
        client_ip: peer.ip(),
        upload,
    });
    send_reply(&mut stream, reply)
}

#[derive(Debug, Default)]
struct RequestHead {
    content_length: u64,
    content_type: Option<String>,
    chunked: bool,
    expect_continue: bool,
    complete: bool,
}

impl RequestHead {
    fn push(&mut self, line: &str) {
        let Some((key, value)) = line.split_once(':') else {
            return;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "content-length" => self.content_length = value.parse().unwrap_or(0),
            "content-type" => self.content_type = Some(value.to_string()),
            "transfer-encoding" => self.chunked = value.to_ascii_lowercase().contains("chunked"),
            "expect" => self.expect_continue = value.eq_ignore_ascii_case("100-continue"),
            _ => {}
        }
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let mut raw = Vec::new();
    reader.by_ref().take(MAX_LINE).read_until(b'\n', &mut raw)?;
    while matches!(raw.last(), Some(b'\n' | b'\r')) {
        raw.pop();
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Decode `application/x-www-form-urlencoded` pairs
fn parse_form(raw: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw).into_owned().collect()
}

/// `Transfer-Encoding: chunked` body decoder
struct ChunkedReader<R> {
    inner: R,
    remaining: u64,
    done: bool,
}

impl<R: BufRead> ChunkedReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            done: false,
        }
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        let line = read_line(&mut self.inner)?;
        let size = line.split(';').next().unwrap_or("").trim();
        self.remaining = u64::from_str_radix(size, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;

        if self.remaining == 0 {
            self.done = true;
            while !read_line(&mut self.inner)?.is_empty() {}
        }
        Ok(())
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            self.next_chunk()?;
            if self.done {
                return Ok(0);
            }
        }

        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunked body"));
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
            let mut crlf = [0u8; 2];
            self.inner.read_exact(&mut crlf)?;
        }
        Ok(n)
    }
}

fn send_reply(stream: &mut TcpStream, reply: Reply) -> Result<()> {
    let content_type = match reply {
        Reply::Envelope(_) => "text/plain; charset=utf-8",
        Reply::FileRange { .. } => "application/octet-stream",
    };
    let length = reply.content_length();
    let mut body = reply.into_body()?;

    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content_type, length
    )?;
    io::copy(&mut body, stream)?;
    stream.flush()?;
    Ok(())
}

fn send_error(stream: &mut TcpStream, status: u16, text: &str) -> Result<()> {
    write!(
        stream,
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        text,
        text.len(),
        text
    )?;
    stream.flush()?;
    Ok(())
}
