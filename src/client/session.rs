//! Client session
//!
//! A [`Session`] is the result of a successful login: the server URL, the
//! username, the token the server derived for it, the protocol options and
//! a transport handle. Every later request is self-contained and carries
//! the username and token.
//!
//! ## Example
//!
//! ```no_run
//! use filegate::client::{Credentials, Session, SessionOptions};
//! use filegate::rpc::RpcValue;
//!
//! let mut session = Session::establish(
//!     "https://files.example.com/filegate",
//!     Some(Credentials::new("u1", "secret")),
//!     SessionOptions::default(),
//! )?;
//! let sum = session.call("add", &[RpcValue::from(33), RpcValue::from(44)])?;
//! assert_eq!(sum, "77");
//! session.logoff();
//! # Ok::<(), filegate::FilegateError>(())
//! ```

use crate::client::{
    HttpRequest, HttpTransport, RequestBody, ServerReply, TransferListener, Transport,
    TransportConfig,
};
use crate::codec::{to_wire, ParameterCodec, RequestParameter};
use crate::error::{FilegateError, Result};
use crate::protocol::{
    param, truncate_token, Action, DEFAULT_CHUNK_LENGTH, INVALID_LOGIN_OR_PASSWORD, OK,
    TEST_CRYPTO_VALUE,
};
use crate::rpc::{EncodingMode, RpcInvocation, RpcValue};
use crate::transfer::TransferRecovery;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Protocol parameters negotiated once per session
#[derive(Clone)]
pub struct SessionOptions {
    /// Shared parameter encryption password; encryption is on when it has
    /// more than one character
    pub encryption_password: Option<String>,
    /// Chunk length for transfers, 0 disables chunking
    pub chunk_length: u64,
    /// Wire encoding of remote calls
    pub encoding_mode: EncodingMode,
    /// Transport settings
    pub transport: TransportConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            encryption_password: None,
            chunk_length: DEFAULT_CHUNK_LENGTH,
            encoding_mode: EncodingMode::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("encrypted", &self.encryption_password.as_ref().map(|p| p.len() > 1))
            .field("chunk_length", &self.chunk_length)
            .field("encoding_mode", &self.encoding_mode)
            .field("transport", &self.transport)
            .finish()
    }
}

/// Login credentials
#[derive(Clone)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// An authenticated (or anonymous) connection to a server
pub struct Session {
    url: Url,
    username: Option<String>,
    token: Option<String>,
    options: SessionOptions,
    codec: ParameterCodec,
    transport: Option<Box<dyn Transport>>,
    pub(crate) recovery: TransferRecovery,
    pub(crate) listener: Option<Arc<dyn TransferListener>>,
    pub(crate) cancel: Arc<AtomicBool>,
}

impl Session {
    /// Connect over HTTP(S)
    ///
    /// With `credentials` absent, no login takes place and the session can
    /// only be used for requests the server accepts without a token.
    pub fn establish(
        url: &str,
        credentials: Option<Credentials>,
        options: SessionOptions,
    ) -> Result<Self> {
        let transport = HttpTransport::new(options.transport.clone())?;
        Self::establish_with(url, credentials, options, Box::new(transport))
    }

    /// Connect over a caller-supplied transport
    pub fn establish_with(
        url: &str,
        credentials: Option<Credentials>,
        options: SessionOptions,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| FilegateError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FilegateError::InvalidUrl {
                url: url.to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let mut session = Session {
            url: parsed,
            username: None,
            token: None,
            codec: ParameterCodec::new(options.encryption_password.as_deref()),
            options,
            transport: Some(transport),
            recovery: TransferRecovery::new(),
            listener: None,
            cancel: Arc::new(AtomicBool::new(false)),
        };

        if let Some(credentials) = credentials {
            session.login(credentials)?;
        }
        Ok(session)
    }

    fn login(&mut self, credentials: Credentials) -> Result<()> {
        let requires_https = self
            .expect_payload(Action::BeforeLogin, Vec::new(), false)?
            .trim()
            .eq_ignore_ascii_case("true");
        if requires_https && self.url.scheme() != "https" {
            return Err(FilegateError::InsecureTransport(self.url.to_string()));
        }

        let params = vec![
            RequestParameter::new(param::TEST_CRYPTO, TEST_CRYPTO_VALUE),
            RequestParameter::new(param::USERNAME, credentials.username.clone()),
            RequestParameter::new(param::PASSWORD, credentials.password),
        ];
        let payload = self.expect_payload(Action::Login, params, false)?;
        let payload = payload.trim();

        if payload.starts_with(INVALID_LOGIN_OR_PASSWORD) {
            return Err(FilegateError::auth(
                credentials.username,
                "invalid login or password",
            ));
        }

        let token = payload
            .strip_prefix(OK)
            .filter(|rest| rest.starts_with(' '))
            .map(|rest| truncate_token(rest.trim()))
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                FilegateError::protocol(format!(
                    "unexpected login reply '{}'",
                    payload.chars().take(64).collect::<String>()
                ))
            })?;

        info!("Logged in to {} as {}", self.url, credentials.username);
        self.username = Some(credentials.username);
        self.token = Some(token);
        Ok(())
    }

    /// Server URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Logged-in username
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Authentication token
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Protocol options
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Whether a token is held
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Whether [`Self::logoff`] was called
    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Forget the credentials and release the transport
    pub fn logoff(&mut self) {
        if let Some(user) = self.username.take() {
            debug!("Logging off {} from {}", user, self.url);
        }
        self.token = None;
        self.transport = None;
        self.recovery = TransferRecovery::new();
    }

    /// Independent session with the same credentials and a fresh transport
    pub fn try_clone(&self) -> Result<Self> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(FilegateError::SessionClosed)?
            .duplicate()?;

        Ok(Session {
            url: self.url.clone(),
            username: self.username.clone(),
            token: self.token.clone(),
            options: self.options.clone(),
            codec: self.codec.clone(),
            transport: Some(transport),
            recovery: TransferRecovery::new(),
            listener: self.listener.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Invoke a remote method and return its textual result
    pub fn call(&mut self, method: &str, args: &[RpcValue]) -> Result<String> {
        let invocation = RpcInvocation::new(method, args)?;
        let mode = self.options.encoding_mode;
        debug!("Calling {} with {} argument(s)", invocation.method(), invocation.len());

        let payload = self.expect_payload(mode.action(), invocation.to_params(mode)?, true)?;
        mode.decode_result(&payload)
    }

    /// Version string of the server runtime
    pub fn remote_version(&mut self) -> Result<String> {
        Ok(self
            .expect_payload(Action::GetRemoteVersion, Vec::new(), true)?
            .trim()
            .to_string())
    }

    /// Length of a remote file, 0 when it does not exist
    pub fn file_length(&mut self, remote: &str) -> Result<u64> {
        let payload = self.expect_payload(
            Action::GetFileLength,
            vec![RequestParameter::new(param::FILENAME, require_path(remote)?)],
            true,
        )?;
        payload
            .trim()
            .parse()
            .map_err(|_| FilegateError::protocol(format!("invalid file length '{}'", payload.trim())))
    }

    /// Whether a remote file exists
    pub fn exists(&mut self, remote: &str) -> Result<bool> {
        let params = vec![RequestParameter::new(param::FILENAME, require_path(remote)?)];
        parse_bool(&self.expect_payload(Action::Exists, params, true)?)
    }

    /// Delete a remote file; false when there was nothing to delete
    pub fn delete(&mut self, remote: &str) -> Result<bool> {
        let params = vec![RequestParameter::new(param::FILENAME, require_path(remote)?)];
        parse_bool(&self.expect_payload(Action::Delete, params, true)?)
    }

    /// Names of the entries of a remote directory
    pub fn list_files(&mut self, remote_dir: &str) -> Result<Vec<String>> {
        let params = vec![RequestParameter::new(param::FILENAME, remote_dir)];
        let payload = self.expect_payload(Action::ListFiles, params, true)?;
        serde_json::from_str(&payload)
            .map_err(|e| FilegateError::protocol(format!("invalid listing: {}", e)))
    }

    /// Send a form request and wait for the reply
    pub(crate) fn send_form(
        &mut self,
        action: Action,
        params: Vec<RequestParameter>,
    ) -> Result<ServerReply> {
        let params = self.with_identity(action, params)?;
        let request = HttpRequest {
            url: self.url.clone(),
            body: RequestBody::Form(to_wire(params)),
            idempotent: action.is_idempotent(),
        };
        self.execute(request)
    }

    /// Send a prepared request and wait for the reply
    pub(crate) fn execute(&mut self, request: HttpRequest) -> Result<ServerReply> {
        let url = self.url.to_string();
        let transport = self.transport.as_mut().ok_or(FilegateError::SessionClosed)?;
        let response = transport.execute(request)?;
        ServerReply::receive(&url, response)
    }

    /// Add action, username and token, then run the codec
    pub(crate) fn with_identity(
        &self,
        action: Action,
        params: Vec<RequestParameter>,
    ) -> Result<Vec<RequestParameter>> {
        if self.transport.is_none() {
            return Err(FilegateError::SessionClosed);
        }

        let mut all = Vec::with_capacity(params.len() + 3);
        all.push(RequestParameter::new(param::ACTION, action.as_str()));
        if action.requires_token() {
            if let Some(username) = &self.username {
                all.push(RequestParameter::new(param::USERNAME, username.clone()));
            }
            if let Some(token) = &self.token {
                all.push(RequestParameter::new(param::TOKEN, token.clone()));
            }
        }
        all.extend(params);
        self.codec.encode(all)
    }

    fn expect_payload(
        &mut self,
        action: Action,
        params: Vec<RequestParameter>,
        token_gated: bool,
    ) -> Result<String> {
        let payload = self.send_form(action, params)?.into_envelope()?.into_payload()?;
        if token_gated {
            self.check_session_payload(&payload)?;
        }
        Ok(payload)
    }

    /// Map the uniform rejection marker to an error
    ///
    /// A logged-in session reads it as [`FilegateError::SessionClosed`]. An
    /// anonymous session has no token to lose, so the marker means the
    /// server does not serve the request without a login.
    pub(crate) fn check_session_payload(&self, payload: &str) -> Result<()> {
        if payload.trim() != INVALID_LOGIN_OR_PASSWORD {
            return Ok(());
        }
        if self.token.is_some() {
            Err(FilegateError::SessionClosed)
        } else {
            Err(FilegateError::auth(
                self.username.as_deref().unwrap_or("anonymous"),
                "request refused without login",
            ))
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("authenticated", &self.token.is_some())
            .field("closed", &self.transport.is_none())
            .field("options", &self.options)
            .finish()
    }
}

fn require_path(remote: &str) -> Result<&str> {
    if remote.trim().is_empty() {
        Err(FilegateError::invalid("remote path is empty"))
    } else {
        Ok(remote)
    }
}

fn parse_bool(payload: &str) -> Result<bool> {
    match payload.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(FilegateError::protocol(format!("expected a boolean, got '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpResponse;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Replays canned replies and records requests
    struct Scripted {
        replies: Arc<Mutex<VecDeque<(u16, String)>>>,
        seen: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    }

    impl Transport for Scripted {
        fn execute(&mut self, request: HttpRequest) -> Result<HttpResponse> {
            if let RequestBody::Form(params) = request.body {
                self.seen.lock().unwrap().push(params);
            }
            let (status, body) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| FilegateError::connection("test", "no more replies"))?;
            Ok(HttpResponse {
                status,
                body: Box::new(Cursor::new(body.into_bytes())),
            })
        }

        fn duplicate(&self) -> Result<Box<dyn Transport>> {
            Ok(Box::new(Scripted {
                replies: Arc::clone(&self.replies),
                seen: Arc::clone(&self.seen),
            }))
        }
    }

    type Seen = Arc<Mutex<Vec<Vec<(String, String)>>>>;

    fn scripted(replies: &[&str]) -> (Box<dyn Transport>, Seen) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = Scripted {
            replies: Arc::new(Mutex::new(
                replies.iter().map(|r| (200, r.to_string())).collect(),
            )),
            seen: Arc::clone(&seen),
        };
        (Box::new(transport), seen)
    }

    fn value<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
        params.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    fn login(url: &str, replies: &[&str]) -> (Result<Session>, Seen) {
        let (transport, seen) = scripted(replies);
        let session = Session::establish_with(
            url,
            Some(Credentials::new("u1", "pw")),
            SessionOptions::default(),
            transport,
        );
        (session, seen)
    }

    #[test]
    fn test_login_stores_truncated_token() {
        let (session, seen) = login(
            "http://localhost/fg",
            &["SEND_OK\nfalse", "SEND_OK\nOK 0123456789abcdef0123456789"],
        );
        let session = session.unwrap();
        assert_eq!(session.username(), Some("u1"));
        assert_eq!(session.token(), Some("0123456789abcdef0123"));

        let seen = seen.lock().unwrap();
        assert_eq!(value(&seen[0], param::ACTION), Some("before_login"));
        assert_eq!(value(&seen[1], param::ACTION), Some("login"));
        assert_eq!(value(&seen[1], param::USERNAME), Some("u1"));
        assert_eq!(value(&seen[1], param::TEST_CRYPTO), Some("TestCrypto"));
        assert_eq!(value(&seen[1], param::VERSION), Some("2"));
    }

    #[test]
    fn test_login_refused() {
        let (session, _) = login(
            "http://localhost/fg",
            &["SEND_OK\nfalse", "SEND_OK\nINVALID_LOGIN_OR_PASSWORD"],
        );
        assert!(matches!(session, Err(FilegateError::AuthenticationError { .. })));
    }

    #[test]
    fn test_unexpected_login_reply_is_protocol_error() {
        let (session, _) = login("http://localhost/fg", &["SEND_OK\nfalse", "SEND_OK\nWELCOME"]);
        assert!(matches!(session, Err(FilegateError::ProtocolError(_))));
    }

    #[test]
    fn test_insecure_transport_refused_before_credentials() {
        let (session, seen) = login("http://localhost/fg", &["SEND_OK\ntrue"]);
        assert!(matches!(session, Err(FilegateError::InsecureTransport(_))));
        assert_eq!(seen.lock().unwrap().len(), 1);

        let (session, _) = login(
            "https://localhost/fg",
            &["SEND_OK\ntrue", "SEND_OK\nOK 0123456789abcdef0123"],
        );
        assert!(session.is_ok());
    }

    #[test]
    fn test_invalid_url() {
        let (transport, _) = scripted(&[]);
        assert!(matches!(
            Session::establish_with("not a url", None, SessionOptions::default(), transport),
            Err(FilegateError::InvalidUrl { .. })
        ));
        let (transport, _) = scripted(&[]);
        assert!(matches!(
            Session::establish_with("ftp://host/x", None, SessionOptions::default(), transport),
            Err(FilegateError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_anonymous_session_sends_nothing() {
        let (transport, seen) = scripted(&[]);
        let session =
            Session::establish_with("http://localhost/fg", None, SessionOptions::default(), transport)
                .unwrap();
        assert!(!session.is_authenticated());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_anonymous_refusal_is_authentication_error() {
        let (transport, seen) = scripted(&["SEND_OK\n42", "SEND_OK\nINVALID_LOGIN_OR_PASSWORD"]);
        let mut session =
            Session::establish_with("http://localhost/fg", None, SessionOptions::default(), transport)
                .unwrap();

        assert_eq!(session.call("answer", &[]).unwrap(), "42");
        let err = session.call("secret", &[]).unwrap_err();
        assert!(matches!(err, FilegateError::AuthenticationError { .. }), "{:?}", err);
        assert!(err.is_authentication_error());

        let seen = seen.lock().unwrap();
        assert_eq!(value(&seen[0], param::USERNAME), None);
        assert_eq!(value(&seen[0], param::TOKEN), None);
    }

    #[test]
    fn test_call_and_session_closed_marker() {
        let (session, seen) = login(
            "http://localhost/fg",
            &[
                "SEND_OK\nfalse",
                "SEND_OK\nOK 0123456789abcdef0123",
                "SEND_OK\n77",
                "SEND_OK\nINVALID_LOGIN_OR_PASSWORD",
            ],
        );
        let mut session = session.unwrap();

        let args = [RpcValue::from(33), RpcValue::from(44)];
        assert_eq!(session.call("add", &args).unwrap(), "77");
        assert!(matches!(session.call("add", &args), Err(FilegateError::SessionClosed)));

        let seen = seen.lock().unwrap();
        let call = &seen[2];
        assert_eq!(value(call, param::ACTION), Some("call_html_encoded"));
        assert_eq!(value(call, param::TOKEN), Some("0123456789abcdef0123"));
        assert_eq!(value(call, param::METHOD_NAME), Some("add"));
        assert_eq!(value(call, param::PARAMS_TYPES), Some(r#"[&quot;int&quot;,&quot;int&quot;]"#));
    }

    #[test]
    fn test_remote_failure_is_reconstructed() {
        let (session, _) = login(
            "http://localhost/fg",
            &[
                "SEND_OK\nfalse",
                "SEND_OK\nOK 0123456789abcdef0123",
                "SEND_FAILED\nv1:not_authorized\ndrop_tables",
            ],
        );
        let mut session = session.unwrap();
        match session.call("drop_tables", &[]) {
            Err(FilegateError::NotAuthorized { method }) => assert_eq!(method, "drop_tables"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!session.is_closed());
    }

    #[test]
    fn test_logoff_then_call_is_session_closed() {
        let (session, _) = login(
            "http://localhost/fg",
            &["SEND_OK\nfalse", "SEND_OK\nOK 0123456789abcdef0123"],
        );
        let mut session = session.unwrap();
        session.logoff();
        assert!(session.is_closed());
        assert!(session.token().is_none());
        assert!(matches!(session.call("add", &[]), Err(FilegateError::SessionClosed)));
        assert!(matches!(session.try_clone(), Err(FilegateError::SessionClosed)));
    }

    #[test]
    fn test_clone_is_independent() {
        let (session, _) = login(
            "http://localhost/fg",
            &["SEND_OK\nfalse", "SEND_OK\nOK 0123456789abcdef0123"],
        );
        let mut session = session.unwrap();
        let clone = session.try_clone().unwrap();
        session.logoff();
        assert_eq!(clone.token(), Some("0123456789abcdef0123"));
        assert!(!clone.is_closed());
    }

    #[test]
    fn test_local_validation_never_sent() {
        let (session, seen) = login(
            "http://localhost/fg",
            &["SEND_OK\nfalse", "SEND_OK\nOK 0123456789abcdef0123"],
        );
        let mut session = session.unwrap();
        assert!(matches!(session.call("  ", &[]), Err(FilegateError::InvalidArgument(_))));
        assert!(matches!(session.exists(""), Err(FilegateError::InvalidArgument(_))));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let credentials = Credentials::new("u1", "hunter2");
        assert!(!format!("{:?}", credentials).contains("hunter2"));

        let options = SessionOptions {
            encryption_password: Some("sesame".into()),
            ..Default::default()
        };
        assert!(!format!("{:?}", options).contains("sesame"));
    }
}
