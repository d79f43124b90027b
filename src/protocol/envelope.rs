//! Response envelope
//!
//! ```text
//! SEND_OK
//! <payload...>
//! ```
//!
//! ```text
//! SEND_FAILED
//! v1:<kind tag>
//! <message, single line>
//! <remote trace, optional, any number of lines>
//! ```

use super::{SEND_FAILED, SEND_OK};
use crate::error::{FilegateError, Result};
use std::fmt;
use std::io::{self, Write};
use std::path::Path;

/// Version prefix of the error kind line
pub const ERROR_RECORD_VERSION: &str = "v1";

/// Kinds of remote failure carried in the error record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Security violation on the server
    Security,
    /// Call refused by the call policy
    NotAuthorized,
    /// Remote file missing
    FileNotFound,
    /// Malformed request argument
    InvalidArgument,
    /// Server-side I/O failure
    Io,
    /// No such remote method
    MethodNotFound,
    /// Server misconfiguration, e.g. mismatched encryption passwords
    Configuration,
    /// Error raised by a user-supplied handler
    Application,
    /// Tag not known to this build
    Other(String),
}

impl RemoteErrorKind {
    /// Wire tag, without the version prefix
    pub fn tag(&self) -> &str {
        match self {
            Self::Security => "security",
            Self::NotAuthorized => "not_authorized",
            Self::FileNotFound => "file_not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::Io => "io",
            Self::MethodNotFound => "method_not_found",
            Self::Configuration => "configuration",
            Self::Application => "application",
            Self::Other(tag) => tag,
        }
    }

    /// Parse a kind line. Unknown or unversioned tags become [`Self::Other`].
    pub fn from_line(line: &str) -> Self {
        let line = line.trim();
        let Some(tag) = line
            .strip_prefix(ERROR_RECORD_VERSION)
            .and_then(|rest| rest.strip_prefix(':'))
        else {
            return Self::Other(line.to_string());
        };

        match tag {
            "security" => Self::Security,
            "not_authorized" => Self::NotAuthorized,
            "file_not_found" => Self::FileNotFound,
            "invalid_argument" => Self::InvalidArgument,
            "io" => Self::Io,
            "method_not_found" => Self::MethodNotFound,
            "configuration" => Self::Configuration,
            "application" => Self::Application,
            _ => Self::Other(line.to_string()),
        }
    }

    fn to_line(&self) -> String {
        match self {
            Self::Other(raw) => raw.clone(),
            known => format!("{}:{}", ERROR_RECORD_VERSION, known.tag()),
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Structured remote error record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    /// Error kind
    pub kind: RemoteErrorKind,
    /// Human-readable message
    pub message: String,
    /// Server-side error chain, if the server exposes it
    pub remote_trace: Option<String>,
}

impl RemoteFailure {
    /// Create a failure without a trace
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remote_trace: None,
        }
    }

    /// Attach a remote trace
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        let trace = trace.into();
        self.remote_trace = if trace.trim().is_empty() { None } else { Some(trace) };
        self
    }

    /// Refusal by the call policy; only the method name is revealed
    pub fn not_authorized(method: &str) -> Self {
        Self::new(RemoteErrorKind::NotAuthorized, method)
    }

    /// Reconstruct the client-side error
    pub fn into_error(self) -> FilegateError {
        match self.kind {
            RemoteErrorKind::NotAuthorized => FilegateError::NotAuthorized {
                method: self.message,
            },
            RemoteErrorKind::Configuration => FilegateError::ConfigError(self.message),
            RemoteErrorKind::Security => FilegateError::SecurityError(self.message),
            kind => FilegateError::Remote {
                kind,
                message: self.message,
                remote_trace: self.remote_trace,
            },
        }
    }

    /// Parse the lines following `SEND_FAILED`
    pub fn parse(record: &str) -> Result<Self> {
        let mut lines = record.splitn(3, '\n');
        let kind_line = lines
            .next()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| FilegateError::protocol("failure record without an error kind"))?;
        let message = lines.next().map(|l| l.trim_end_matches('\r')).unwrap_or("");
        let trace = lines.next().unwrap_or("");

        Ok(Self::new(RemoteErrorKind::from_line(kind_line), unescape_line(message)).with_trace(trace))
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteFailure {}

impl RemoteFailure {
    /// Failure record for a server-side error
    ///
    /// Filesystem errors never reveal where the server keeps its files: the
    /// message names `relative`, the path as the client sent it, or failing
    /// that the bare file name, and gives only the I/O error kind.
    pub fn from_local(err: &FilegateError, relative: Option<&str>) -> Self {
        let shown = |path: &Path| match relative {
            Some(relative) => relative.to_string(),
            None => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let kind = RemoteErrorKind::of(err);
        let message = match err.root() {
            FilegateError::NotFound(path) => format!("File not found: {}", shown(path)),
            FilegateError::Io { path, source } if path.as_os_str().is_empty() => {
                format!("I/O error: {}", source.kind())
            }
            FilegateError::Io { path, source } => {
                format!("I/O error at '{}': {}", shown(path), source.kind())
            }
            _ => err.to_string(),
        };
        Self::new(kind, message)
    }
}

impl From<FilegateError> for RemoteFailure {
    fn from(err: FilegateError) -> Self {
        Self::from_local(&err, None)
    }
}

impl RemoteErrorKind {
    fn of(err: &FilegateError) -> Self {
        match err.root() {
            FilegateError::NotFound(_) => RemoteErrorKind::FileNotFound,
            FilegateError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                RemoteErrorKind::FileNotFound
            }
            FilegateError::Io { .. } => RemoteErrorKind::Io,
            FilegateError::InvalidArgument(_) | FilegateError::ProtocolError(_) => {
                RemoteErrorKind::InvalidArgument
            }
            FilegateError::SecurityError(_) => RemoteErrorKind::Security,
            FilegateError::ConfigError(_) | FilegateError::CryptoError(_) => {
                RemoteErrorKind::Configuration
            }
            FilegateError::NotAuthorized { .. } => RemoteErrorKind::NotAuthorized,
            _ => RemoteErrorKind::Application,
        }
    }
}

/// A complete server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEnvelope {
    /// `SEND_OK` with its payload
    Ok(String),
    /// `SEND_FAILED` with the error record
    Failed(RemoteFailure),
}

impl ResponseEnvelope {
    /// Successful reply
    pub fn ok(payload: impl Into<String>) -> Self {
        Self::Ok(payload.into())
    }

    /// Status token of this reply
    pub fn status(&self) -> &'static str {
        match self {
            Self::Ok(_) => SEND_OK,
            Self::Failed(_) => SEND_FAILED,
        }
    }

    /// Write the wire form
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.status().as_bytes())?;
        writer.write_all(b"\n")?;
        match self {
            Self::Ok(payload) => writer.write_all(payload.as_bytes()),
            Self::Failed(failure) => {
                writeln!(writer, "{}", failure.kind.to_line())?;
                write!(writer, "{}", escape_line(&failure.message))?;
                if let Some(trace) = &failure.remote_trace {
                    write!(writer, "\n{}", trace)?;
                }
                Ok(())
            }
        }
    }

    /// Wire form as a string
    pub fn to_text(&self) -> String {
        let mut out = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.write_to(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Parse a complete textual reply
    pub fn parse(text: &str) -> Result<Self> {
        let (status, rest) = text.split_once('\n').unwrap_or((text, ""));
        Self::from_parts(status, rest)
    }

    /// Build from a status line and the remaining content
    pub fn from_parts(status: &str, rest: &str) -> Result<Self> {
        match status.trim_end_matches('\r').trim() {
            SEND_OK => Ok(Self::Ok(rest.to_string())),
            SEND_FAILED => Ok(Self::Failed(RemoteFailure::parse(rest)?)),
            other => Err(FilegateError::protocol(format!(
                "unexpected status line '{}'",
                other.chars().take(64).collect::<String>()
            ))),
        }
    }

    /// Payload on success, reconstructed error on failure
    pub fn into_payload(self) -> Result<String> {
        match self {
            Self::Ok(payload) => Ok(payload),
            Self::Failed(failure) => Err(failure.into_error()),
        }
    }
}

fn escape_line(message: &str) -> String {
    message.replace('\\', "\\\\").replace('\r', "").replace('\n', "\\n")
}

fn unescape_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_envelope_wire_form() {
        let envelope = ResponseEnvelope::ok("OK 0123456789abcdef0123");
        assert_eq!(envelope.to_text(), "SEND_OK\nOK 0123456789abcdef0123");
        assert_eq!(ResponseEnvelope::parse(&envelope.to_text()).unwrap(), envelope);
    }

    #[test]
    fn test_payload_keeps_its_newlines() {
        let envelope = ResponseEnvelope::ok("line one\nline two\n");
        assert_eq!(
            ResponseEnvelope::parse(&envelope.to_text()).unwrap().into_payload().unwrap(),
            "line one\nline two\n"
        );
    }

    #[test]
    fn test_failure_record() {
        let failure = RemoteFailure::new(RemoteErrorKind::Application, "division by zero\nin add")
            .with_trace("handler failed\n\nCaused by:\n    division by zero");
        let text = ResponseEnvelope::Failed(failure.clone()).to_text();

        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(SEND_FAILED));
        assert_eq!(lines.next(), Some("v1:application"));
        assert_eq!(lines.next(), Some("division by zero\\nin add"));

        assert_eq!(ResponseEnvelope::parse(&text).unwrap(), ResponseEnvelope::Failed(failure));
    }

    #[test]
    fn test_unknown_kind_maps_to_generic_remote_error() {
        let parsed = ResponseEnvelope::parse("SEND_FAILED\nv9:quota\nover quota").unwrap();
        match parsed.into_payload() {
            Err(FilegateError::Remote { kind, message, remote_trace }) => {
                assert_eq!(kind, RemoteErrorKind::Other("v9:quota".into()));
                assert_eq!(message, "over quota");
                assert!(remote_trace.is_none());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_refusal_maps_to_not_authorized() {
        let text = ResponseEnvelope::Failed(RemoteFailure::not_authorized("shutdown")).to_text();
        match ResponseEnvelope::parse(&text).unwrap().into_payload() {
            Err(FilegateError::NotAuthorized { method }) => assert_eq!(method, "shutdown"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        assert!(matches!(
            ResponseEnvelope::parse("<html>502 Bad Gateway</html>"),
            Err(FilegateError::ProtocolError(_))
        ));
        assert!(matches!(
            ResponseEnvelope::parse("SEND_FAILED\n"),
            Err(FilegateError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_local_errors_map_to_kinds() {
        let failure: RemoteFailure = FilegateError::NotFound("/srv/a.txt".into()).into();
        assert_eq!(failure.kind, RemoteErrorKind::FileNotFound);
        assert_eq!(failure.message, "File not found: a.txt");

        let failure: RemoteFailure = FilegateError::invalid("bad chunk index").into();
        assert_eq!(failure.kind, RemoteErrorKind::InvalidArgument);
    }

    #[test]
    fn test_local_messages_hide_server_paths() {
        let err = FilegateError::io(
            "/srv/files/u1/docs/a.txt",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied: /srv/files/u1/docs/a.txt"),
        )
        .with_context("reading upload");

        let failure = RemoteFailure::from_local(&err, Some("docs/a.txt"));
        assert_eq!(failure.kind, RemoteErrorKind::Io);
        assert!(failure.message.contains("'docs/a.txt'"), "{}", failure.message);
        assert!(!failure.message.contains("/srv"), "{}", failure.message);

        let failure = RemoteFailure::from_local(&FilegateError::NotFound("/srv/files/b.bin".into()), None);
        assert_eq!(failure.kind, RemoteErrorKind::FileNotFound);
        assert_eq!(failure.message, "File not found: b.bin");

        let failure = RemoteFailure::from_local(&FilegateError::invalid("bad chunk index"), Some("x"));
        assert_eq!(failure.message, "Invalid argument: bad chunk index");
    }

    #[test]
    fn test_escape_round_trip() {
        for message in ["plain", "a\\nb", "multi\nline\\", "trailing\\"] {
            assert_eq!(unescape_line(&escape_line(message)), message);
        }
    }
}
