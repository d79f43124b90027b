//! Request dispatch
//!
//! Every request goes through the same steps:
//! 1. decode the parameters (decryption, canary check, unescaping)
//! 2. route on the action code
//! 3. login, or verify the token and re-apply the ban and IP checks
//! 4. run the handler and wrap its outcome in a response envelope
//!
//! A bad token, a banned user and a rejected address all produce the same
//! `SEND_OK` / `INVALID_LOGIN_OR_PASSWORD` reply, whatever the action.
//! The one exception is a call carrying neither username nor token to a
//! method the server lists as anonymous.

use crate::codec::{DecodedParams, ParameterCodec};
use crate::error::{FilegateError, Result};
use crate::protocol::{
    derive_token, param, verify_token, Action, RemoteErrorKind, RemoteFailure, ResponseEnvelope,
    INVALID_LOGIN_OR_PASSWORD, OK, SEND_OK,
};
use crate::rpc::{CallContext, EncodingMode, MethodRegistry, RpcInvocation};
use crate::server::{
    AllowAll, CallPolicy, CredentialChecker, LoginSpeedReducer, NoDelay, SecurityGate,
    SecurityPolicy, StaticCredentials, StoragePathResolver,
};
use crate::transfer::{ChunkAggregator, ChunkOutcome, IncomingChunk};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Binary part of an upload, already spooled to disk
#[derive(Debug)]
pub struct UploadedFile {
    /// File name from the part headers
    pub file_name: String,
    /// Spooled content
    pub content: tempfile::NamedTempFile,
}

/// A request as received by a listener
#[derive(Debug)]
pub struct ServerRequest {
    /// Raw parameters, before decoding
    pub params: Vec<(String, String)>,
    /// Client address
    pub client_ip: IpAddr,
    /// Upload content, for multipart requests
    pub upload: Option<UploadedFile>,
}

impl ServerRequest {
    /// Form request without upload content
    pub fn form(params: Vec<(String, String)>, client_ip: IpAddr) -> Self {
        Self {
            params,
            client_ip,
            upload: None,
        }
    }
}

/// What to send back
#[derive(Debug)]
pub enum Reply {
    /// Textual envelope
    Envelope(ResponseEnvelope),
    /// `SEND_OK` followed by a byte range of a file
    FileRange {
        /// File to read
        path: PathBuf,
        /// First byte
        offset: u64,
        /// Number of bytes
        length: u64,
    },
}

impl Reply {
    fn ok(payload: impl Into<String>) -> Self {
        Reply::Envelope(ResponseEnvelope::ok(payload))
    }

    fn invalid() -> Self {
        Self::ok(INVALID_LOGIN_OR_PASSWORD)
    }

    fn failed(failure: RemoteFailure) -> Self {
        Reply::Envelope(ResponseEnvelope::Failed(failure))
    }

    /// Envelope, if this is a textual reply
    pub fn envelope(&self) -> Option<&ResponseEnvelope> {
        match self {
            Reply::Envelope(envelope) => Some(envelope),
            Reply::FileRange { .. } => None,
        }
    }

    /// Body length in bytes
    pub fn content_length(&self) -> u64 {
        match self {
            Reply::Envelope(envelope) => envelope.to_text().len() as u64,
            Reply::FileRange { length, .. } => SEND_OK.len() as u64 + 1 + length,
        }
    }

    /// Body as a stream
    pub fn into_body(self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            Reply::Envelope(envelope) => Ok(Box::new(Cursor::new(envelope.to_text().into_bytes()))),
            Reply::FileRange {
                path,
                offset,
                length,
            } => {
                let mut file = File::open(&path)?;
                file.seek(SeekFrom::Start(offset))?;
                let header = Cursor::new(format!("{}\n", SEND_OK).into_bytes());
                Ok(Box::new(header.chain(file.take(length))))
            }
        }
    }
}

/// Routes requests to handlers behind the security gate
pub struct Dispatcher {
    secret: String,
    codec: ParameterCodec,
    force_secure: bool,
    methods: MethodRegistry,
    anonymous_methods: HashSet<String>,
    gate: SecurityGate,
    resolver: Arc<dyn StoragePathResolver>,
    chunks: ChunkAggregator,
    expose_traces: bool,
}

impl Dispatcher {
    /// Start building a dispatcher around the server secret
    pub fn builder(secret: impl Into<String>) -> DispatcherBuilder {
        DispatcherBuilder::new(secret)
    }

    /// Method registry
    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    /// Chunk aggregation state
    pub fn chunks(&self) -> &ChunkAggregator {
        &self.chunks
    }

    /// Handle one request
    pub fn dispatch(&self, request: ServerRequest) -> Reply {
        let ServerRequest {
            params,
            client_ip,
            upload,
        } = request;

        let params = match self
            .codec
            .decode(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        {
            Ok(params) => params,
            Err(e) => {
                warn!("Undecodable request from {}: {}", client_ip, e);
                return self.failure(e, None);
            }
        };

        let action = match params.get(param::ACTION).map(str::parse::<Action>) {
            Some(Ok(action)) => action,
            Some(Err(message)) => {
                return Reply::failed(RemoteFailure::new(RemoteErrorKind::InvalidArgument, message))
            }
            None => {
                return Reply::failed(RemoteFailure::new(
                    RemoteErrorKind::InvalidArgument,
                    "missing action",
                ))
            }
        };
        debug!("{} from {}", action, client_ip);

        match action {
            Action::BeforeLogin => Reply::ok(self.force_secure.to_string()),
            Action::Login => self.login(&params, client_ip),
            _ => {
                let username = params.get_or_empty(param::USERNAME).trim();
                let token = params.get_or_empty(param::TOKEN);
                let outcome = if username.is_empty() && token.is_empty() {
                    match EncodingMode::from_action(action) {
                        Some(mode) => self.anonymous_call(mode, &params, client_ip),
                        None => return Reply::invalid(),
                    }
                } else if self.verify(username, token, client_ip) {
                    self.handle(action, username, &params, client_ip, upload)
                } else {
                    return Reply::invalid();
                };
                outcome.unwrap_or_else(|e| self.failure(e, params.get(param::FILENAME)))
            }
        }
    }

    /// Size an upload part may have, judged from the fields ahead of it
    ///
    /// Returns `None` when the request would be refused anyway, so the
    /// listener can skip spooling the part. Otherwise returns the declared
    /// chunk length, or `u64::MAX` for an unchunked upload.
    pub fn authorize_upload(&self, fields: &[(String, String)], client_ip: IpAddr) -> Option<u64> {
        let params = self
            .codec
            .decode(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .ok()?;
        if !matches!(params.get(param::ACTION).map(str::parse::<Action>), Some(Ok(Action::Upload))) {
            return None;
        }

        let username = params.get_or_empty(param::USERNAME).trim();
        if !self.verify(username, params.get_or_empty(param::TOKEN), client_ip) {
            return None;
        }
        match params.get_u64(param::CHUNK_LENGTH).ok()? {
            Some(length) if length > 0 => Some(length),
            _ => Some(u64::MAX),
        }
    }

    fn login(&self, params: &DecodedParams, client_ip: IpAddr) -> Reply {
        let username = params.get_or_empty(param::USERNAME).trim();
        let password = params.get_or_empty(param::PASSWORD);

        if self.gate.login(username, password, client_ip) {
            info!("{} logged in from {}", username, client_ip);
            Reply::ok(format!("{} {}", OK, derive_token(username, &self.secret)))
        } else {
            Reply::invalid()
        }
    }

    fn verify(&self, username: &str, token: &str, client_ip: IpAddr) -> bool {
        if username.is_empty() || !verify_token(username, &self.secret, token) {
            debug!("Token mismatch for '{}' from {}", username, client_ip);
            return false;
        }
        self.gate.admit(username, client_ip).is_ok()
    }

    fn handle(
        &self,
        action: Action,
        username: &str,
        params: &DecodedParams,
        client_ip: IpAddr,
        upload: Option<UploadedFile>,
    ) -> Result<Reply> {
        match action {
            Action::GetRemoteVersion => Ok(Reply::ok(concat!("filegate/", env!("CARGO_PKG_VERSION")))),
            Action::Call | Action::CallHtmlEncoded => {
                let mode = EncodingMode::from_action(action).unwrap_or_default();
                let invocation = RpcInvocation::from_params(params, mode)?;
                self.call(mode, username, &invocation, client_ip)
            }
            Action::GetFileLength => {
                let path = self.resolve(username, params)?;
                let length = match std::fs::metadata(&path) {
                    Ok(meta) if meta.is_file() => meta.len(),
                    Ok(_) => 0,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(FilegateError::io(&path, e)),
                };
                Ok(Reply::ok(length.to_string()))
            }
            Action::Upload => self.upload(username, params, upload),
            Action::Download => self.download(username, params),
            Action::Exists => {
                let path = self.resolve(username, params)?;
                Ok(Reply::ok(path.is_file().to_string()))
            }
            Action::Delete => {
                let path = self.resolve(username, params)?;
                if !path.is_file() {
                    return Ok(Reply::ok("false"));
                }
                std::fs::remove_file(&path).map_err(|e| FilegateError::io(&path, e))?;
                info!("{} deleted {}", username, path.display());
                Ok(Reply::ok("true"))
            }
            Action::ListFiles => {
                let dir = self
                    .resolver
                    .resolve(username, params.get_or_empty(param::FILENAME))?;
                let entries = std::fs::read_dir(&dir).map_err(|e| FilegateError::io(&dir, e))?;
                let mut names = Vec::new();
                for entry in entries {
                    let entry = entry.map_err(|e| FilegateError::io(&dir, e))?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !name.starts_with('.') {
                        names.push(name);
                    }
                }
                names.sort();
                Ok(Reply::ok(serde_json::to_string(&names)?))
            }
            Action::BeforeLogin | Action::Login => Err(FilegateError::protocol("unrouted action")),
        }
    }

    fn anonymous_call(&self, mode: EncodingMode, params: &DecodedParams, client_ip: IpAddr) -> Result<Reply> {
        let method = params.get_or_empty(param::METHOD_NAME).trim();
        if !self.anonymous_methods.contains(method) || !self.gate.policy().admits_ip(&client_ip) {
            debug!("Refused anonymous call to '{}' from {}", method, client_ip);
            return Ok(Reply::invalid());
        }
        let invocation = RpcInvocation::from_params(params, mode)?;
        self.call(mode, "", &invocation, client_ip)
    }

    fn call(
        &self,
        mode: EncodingMode,
        username: &str,
        invocation: &RpcInvocation,
        client_ip: IpAddr,
    ) -> Result<Reply> {
        let args = invocation.arguments()?;
        let method = invocation.method();

        if !self.gate.authorize_call(username, client_ip, method, &args) {
            return Ok(Reply::failed(RemoteFailure::not_authorized(method)));
        }

        let context = CallContext {
            username,
            client_ip,
        };
        Ok(match self.methods.invoke(&context, method, &args) {
            Ok(result) => Reply::ok(mode.encode_result(&result)),
            Err(failure) => {
                debug!("{} failed: {}", method, failure);
                Reply::failed(self.redact(failure))
            }
        })
    }

    fn upload(
        &self,
        username: &str,
        params: &DecodedParams,
        upload: Option<UploadedFile>,
    ) -> Result<Reply> {
        let path = self.resolve(username, params)?;
        let mut upload =
            upload.ok_or_else(|| FilegateError::invalid("upload without a file part"))?;

        let chunk_length = params.get_u64(param::CHUNK_LENGTH)?.unwrap_or(0);
        let chunk = if chunk_length == 0 {
            IncomingChunk::single()
        } else {
            IncomingChunk {
                index: params.get_u64(param::CHUNK_INDEX)?.unwrap_or(0),
                count: params.get_u64(param::CHUNK_COUNT)?.unwrap_or(1),
            }
        };

        let content = upload.content.as_file_mut();
        content.seek(SeekFrom::Start(0))?;
        match self.chunks.store(username, &path, chunk, content)? {
            ChunkOutcome::Stored => debug!("{} sent chunk {} of {}", username, chunk.index, path.display()),
            ChunkOutcome::Completed(length) => {
                info!("{} uploaded {} ({} bytes)", username, path.display(), length)
            }
        }
        Ok(Reply::ok(OK))
    }

    fn download(&self, username: &str, params: &DecodedParams) -> Result<Reply> {
        let path = self.resolve(username, params)?;
        let meta = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(FilegateError::NotFound(path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(FilegateError::NotFound(path)),
            Err(e) => return Err(FilegateError::io(&path, e)),
        };
        let total = meta.len();

        let chunk_length = params.get_u64(param::CHUNK_LENGTH)?.unwrap_or(0);
        let (offset, length) = if chunk_length == 0 {
            (0, total)
        } else {
            let index = params.get_u64(param::CHUNK_INDEX)?.unwrap_or(0);
            let offset = index
                .checked_mul(chunk_length)
                .filter(|offset| *offset < total || (total == 0 && index == 0))
                .ok_or_else(|| {
                    FilegateError::invalid(format!("chunk {} beyond end of file", index))
                })?;
            (offset, chunk_length.min(total - offset))
        };

        Ok(Reply::FileRange {
            path,
            offset,
            length,
        })
    }

    fn resolve(&self, username: &str, params: &DecodedParams) -> Result<PathBuf> {
        let relative = params.require(param::FILENAME)?;
        if relative.trim().is_empty() {
            return Err(FilegateError::invalid("empty file name"));
        }
        self.resolver.resolve(username, relative)
    }

    fn failure(&self, err: FilegateError, relative: Option<&str>) -> Reply {
        let failure = RemoteFailure::from_local(&err, relative).with_trace(format!("{:?}", err));
        Reply::failed(self.redact(failure))
    }

    fn redact(&self, failure: RemoteFailure) -> RemoteFailure {
        if self.expose_traces {
            failure
        } else {
            RemoteFailure {
                remote_trace: None,
                ..failure
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("force_secure", &self.force_secure)
            .field("encrypting", &self.codec.is_encrypting())
            .field("methods", &self.methods)
            .field("anonymous_methods", &self.anonymous_methods)
            .field("gate", &self.gate)
            .field("expose_traces", &self.expose_traces)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Dispatcher`]
pub struct DispatcherBuilder {
    secret: String,
    encryption_password: Option<String>,
    force_secure: bool,
    methods: MethodRegistry,
    anonymous_methods: HashSet<String>,
    policy: SecurityPolicy,
    credentials: Arc<dyn CredentialChecker>,
    calls: Arc<dyn CallPolicy>,
    reducer: Arc<dyn LoginSpeedReducer>,
    resolver: Option<Arc<dyn StoragePathResolver>>,
    abandoned_upload_ttl: Duration,
    expose_traces: bool,
}

impl DispatcherBuilder {
    fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            encryption_password: None,
            force_secure: false,
            methods: MethodRegistry::new(),
            anonymous_methods: HashSet::new(),
            policy: SecurityPolicy::new(),
            credentials: Arc::new(StaticCredentials::default()),
            calls: Arc::new(AllowAll),
            reducer: Arc::new(NoDelay),
            resolver: None,
            abandoned_upload_ttl: ChunkAggregator::DEFAULT_IDLE_TTL,
            expose_traces: false,
        }
    }

    /// Shared parameter encryption password
    pub fn encryption_password(mut self, password: Option<String>) -> Self {
        self.encryption_password = password;
        self
    }

    /// Require clients to connect over https
    pub fn force_secure(mut self, force: bool) -> Self {
        self.force_secure = force;
        self
    }

    /// Callable methods
    pub fn methods(mut self, methods: MethodRegistry) -> Self {
        self.methods = methods;
        self
    }

    /// Methods callable without logging in
    ///
    /// Anonymous calls still pass the IP filters and the call policy, with
    /// an empty username.
    pub fn anonymous_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.anonymous_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Banned usernames and IP filters
    pub fn policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Password check
    pub fn credentials(mut self, credentials: Arc<dyn CredentialChecker>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Call authorization
    pub fn call_policy(mut self, calls: Arc<dyn CallPolicy>) -> Self {
        self.calls = calls;
        self
    }

    /// Failed-login throttling
    pub fn login_speed_reducer(mut self, reducer: Arc<dyn LoginSpeedReducer>) -> Self {
        self.reducer = reducer;
        self
    }

    /// Storage layout
    pub fn resolver(mut self, resolver: Arc<dyn StoragePathResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// How long an unfinished chunked upload may sit idle before its parts are discarded
    pub fn abandoned_upload_ttl(mut self, ttl: Duration) -> Self {
        self.abandoned_upload_ttl = ttl;
        self
    }

    /// Send server-side error chains to clients
    pub fn expose_traces(mut self, expose: bool) -> Self {
        self.expose_traces = expose;
        self
    }

    /// Build the dispatcher
    pub fn build(self) -> Result<Dispatcher> {
        if self.secret.is_empty() {
            return Err(FilegateError::config("server secret is empty"));
        }
        let resolver = self
            .resolver
            .ok_or_else(|| FilegateError::config("no storage path resolver configured"))?;

        Ok(Dispatcher {
            codec: ParameterCodec::new(self.encryption_password.as_deref()),
            secret: self.secret,
            force_secure: self.force_secure,
            methods: self.methods,
            anonymous_methods: self.anonymous_methods,
            gate: SecurityGate::new(self.policy, self.credentials, self.calls, self.reducer),
            resolver,
            chunks: ChunkAggregator::with_idle_ttl(self.abandoned_upload_ttl),
            expose_traces: self.expose_traces,
        })
    }
}
