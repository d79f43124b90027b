//! End-to-end client/server scenarios over the loopback transport

use crate::client::{
    Credentials, HttpRequest, HttpResponse, RequestBody, Session, SessionOptions, TransferListener,
    Transport,
};
use crate::codec::{to_wire, ParameterCodec, RequestParameter};
use crate::error::{FilegateError, Result};
use crate::protocol::{derive_token, param, ResponseEnvelope, INVALID_LOGIN_OR_PASSWORD};
use crate::rpc::{EncodingMode, RpcValue};
use crate::server::{
    builtin_methods, Dispatcher, LoopbackTransport, MethodAllowList, RootDirectoryResolver,
    SecurityPolicy, ServerRequest, StaticCredentials,
};
use crate::transfer::{StreamSource, TransferDirection};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const URL: &str = "http://localhost/filegate";
const SECRET: &str = "e2e-secret";

/// One observed request: action and chunk index
type Seen = Arc<Mutex<Vec<(String, Option<u64>)>>>;

/// Loopback transport that records requests and fails chosen ones
struct Faulty {
    inner: LoopbackTransport,
    seen: Seen,
    /// (action, chunk index) to fail once with a connection error
    fail_once: Arc<Mutex<Option<(String, u64)>>>,
}

impl Faulty {
    fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            inner: LoopbackTransport::new(dispatcher),
            seen: Arc::default(),
            fail_once: Arc::default(),
        }
    }
}

impl Transport for Faulty {
    fn execute(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let fields = match &request.body {
            RequestBody::Form(fields) => fields,
            RequestBody::Multipart { fields, .. } => fields,
        };
        let lookup = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        let action = lookup(param::ACTION).unwrap_or_default();
        let index = lookup(param::CHUNK_INDEX).and_then(|v| v.parse().ok());
        self.seen.lock().unwrap().push((action.clone(), index));

        let mut fail = self.fail_once.lock().unwrap();
        if let Some((fail_action, fail_index)) = fail.as_ref() {
            if *fail_action == action && Some(*fail_index) == index {
                *fail = None;
                return Err(FilegateError::connection(URL, "connection reset by peer"));
            }
        }
        drop(fail);
        self.inner.execute(request)
    }

    fn duplicate(&self) -> Result<Box<dyn Transport>> {
        self.inner.duplicate()
    }
}

struct Server {
    dir: TempDir,
    dispatcher: Arc<Dispatcher>,
    audit: Arc<MethodAllowList>,
}

fn server_with(policy: SecurityPolicy) -> Server {
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(MethodAllowList::new(["add", "echo", "whoami"]));
    let dispatcher = Dispatcher::builder(SECRET)
        .methods(builtin_methods())
        .policy(policy)
        .credentials(Arc::new(StaticCredentials::new([("u1", "pw1"), ("u2", "pw2")])))
        .call_policy(audit.clone())
        .resolver(Arc::new(RootDirectoryResolver::new(dir.path(), false)))
        .build()
        .unwrap();
    Server {
        dir,
        dispatcher: Arc::new(dispatcher),
        audit,
    }
}

fn server() -> Server {
    server_with(SecurityPolicy::new())
}

fn login(server: &Server, options: SessionOptions) -> (Session, Seen, Arc<Mutex<Option<(String, u64)>>>) {
    let transport = Faulty::new(Arc::clone(&server.dispatcher));
    let seen = Arc::clone(&transport.seen);
    let fail = Arc::clone(&transport.fail_once);
    let session = Session::establish_with(
        URL,
        Some(Credentials::new("u1", "pw1")),
        options,
        Box::new(transport),
    )
    .unwrap();
    (session, seen, fail)
}

fn chunked(chunk_length: u64) -> SessionOptions {
    SessionOptions {
        chunk_length,
        ..Default::default()
    }
}

fn count(seen: &Seen, action: &str) -> Vec<Option<u64>> {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|(a, _)| a == action)
        .map(|(_, i)| *i)
        .collect()
}

fn pattern(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i * 31 % 251) as u8).collect()
}

fn raw_request(server: &Server, params: &[(&str, &str)]) -> ResponseEnvelope {
    let params = params
        .iter()
        .map(|(k, v)| RequestParameter::new(*k, *v))
        .collect();
    let wire = to_wire(ParameterCodec::plain().encode(params).unwrap());
    let reply = server
        .dispatcher
        .dispatch(ServerRequest::form(wire, "127.0.0.1".parse().unwrap()));
    reply.envelope().cloned().unwrap()
}

#[test]
fn scenario_a_login_call_and_forged_token() {
    let server = server();
    let (mut session, _, _) = login(&server, SessionOptions::default());

    assert_eq!(session.token(), Some(derive_token("u1", SECRET).as_str()));
    assert_eq!(session.call("whoami", &[]).unwrap(), "u1");
    assert_eq!(
        session.call("echo", &[RpcValue::from("<a href=\"x\">&amp;</a>")]).unwrap(),
        "<a href=\"x\">&amp;</a>"
    );

    let forged = raw_request(
        &server,
        &[
            ("action", "call_html_encoded"),
            ("username", "u1"),
            ("token", "deadbeef"),
            ("methodName", "whoami"),
            ("paramsTypes", "[]"),
            ("paramsValues", "[]"),
        ],
    );
    assert_eq!(forged, ResponseEnvelope::ok(INVALID_LOGIN_OR_PASSWORD));
}

#[test]
fn scenario_a_bad_password() {
    let server = server();
    let err = Session::establish_with(
        URL,
        Some(Credentials::new("u1", "wrong")),
        SessionOptions::default(),
        Box::new(LoopbackTransport::new(Arc::clone(&server.dispatcher))),
    )
    .unwrap_err();
    assert!(err.is_authentication_error());
}

#[test]
fn scenario_b_chunked_upload_and_download() {
    let server = server();
    let (mut session, seen, _) = login(&server, chunked(10 * 1000 * 1000));

    let content = pattern(25 * 1000 * 1000);
    session
        .upload_stream(Cursor::new(content.clone()), content.len() as u64, "big/data.bin")
        .unwrap();

    assert_eq!(count(&seen, "upload"), vec![Some(0), Some(1), Some(2)]);
    let stored = std::fs::read(server.dir.path().join("big/data.bin")).unwrap();
    assert_eq!(Sha256::digest(&stored), Sha256::digest(&content));
    assert_eq!(server.dispatcher.chunks().in_flight(), 0);

    let mut fetched = session.download_stream("big/data.bin").unwrap();
    let mut back = Vec::new();
    fetched.read_to_end(&mut back).unwrap();
    assert_eq!(count(&seen, "download").len(), 3);
    assert_eq!(Sha256::digest(&back), Sha256::digest(&content));
}

#[test]
fn scenario_c_call_policy_and_audit() {
    let server = server();
    let (mut session, _, _) = login(&server, SessionOptions::default());

    assert_eq!(session.call("add", &[RpcValue::from(33), RpcValue::from(44)]).unwrap(), "77");

    let err = session.call("server_time", &[]).unwrap_err();
    assert!(matches!(err, FilegateError::NotAuthorized { ref method } if method == "server_time"));
    let refused = server.audit.refused();
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].username, "u1");
    assert_eq!(refused[0].method, "server_time");
}

#[test]
fn legacy_encoding_and_encryption() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = Arc::new(
        Dispatcher::builder(SECRET)
            .encryption_password(Some("shared".to_string()))
            .methods(builtin_methods())
            .credentials(Arc::new(StaticCredentials::new([("u1", "pw1")])))
            .resolver(Arc::new(RootDirectoryResolver::new(dir.path(), false)))
            .build()
            .unwrap(),
    );

    let options = SessionOptions {
        encryption_password: Some("shared".to_string()),
        encoding_mode: EncodingMode::LegacyBase64,
        ..Default::default()
    };
    let mut session = Session::establish_with(
        URL,
        Some(Credentials::new("u1", "pw1")),
        options,
        Box::new(LoopbackTransport::new(Arc::clone(&dispatcher))),
    )
    .unwrap();
    assert_eq!(session.call("echo", &[RpcValue::from("ünïcode & <tags>")]).unwrap(), "ünïcode & <tags>");

    let mismatched = SessionOptions {
        encryption_password: Some("other".to_string()),
        ..Default::default()
    };
    let err = Session::establish_with(
        URL,
        Some(Credentials::new("u1", "pw1")),
        mismatched,
        Box::new(LoopbackTransport::new(dispatcher)),
    )
    .unwrap_err();
    assert!(matches!(err, FilegateError::ConfigError(_)), "{:?}", err);
}

#[test]
fn upload_resumes_at_failed_chunk() {
    let server = server();
    let (mut session, seen, fail) = login(&server, chunked(1000));
    let content = pattern(5500);
    let mut source = StreamSource::new(Cursor::new(content.clone()), content.len() as u64);

    *fail.lock().unwrap() = Some(("upload".to_string(), 3));
    let err = session.upload(&mut source, "r.bin").unwrap_err();
    assert!(err.is_resumable());
    assert_eq!(count(&seen, "upload"), vec![Some(0), Some(1), Some(2), Some(3)]);

    seen.lock().unwrap().clear();
    session.upload(&mut source, "r.bin").unwrap();
    assert_eq!(count(&seen, "upload"), vec![Some(3), Some(4), Some(5)]);
    assert_eq!(std::fs::read(server.dir.path().join("r.bin")).unwrap(), content);
}

#[test]
fn download_file_resumes_at_failed_chunk() {
    let server = server();
    let content = pattern(4200);
    std::fs::write(server.dir.path().join("d.bin"), &content).unwrap();
    let (mut session, seen, fail) = login(&server, chunked(1000));
    let local = server.dir.path().join("local.bin");

    *fail.lock().unwrap() = Some(("download".to_string(), 2));
    assert!(session.download_file("d.bin", &local).unwrap_err().is_resumable());

    seen.lock().unwrap().clear();
    assert_eq!(session.download_file("d.bin", &local).unwrap(), 4200);
    assert_eq!(count(&seen, "download"), vec![Some(2), Some(3), Some(4)]);
    assert_eq!(std::fs::read(&local).unwrap(), content);
}

struct CancelAfter {
    flag: Mutex<Option<Arc<AtomicBool>>>,
    chunks: AtomicU64,
    after: u64,
}

impl TransferListener for CancelAfter {
    fn advanced(&self, _bytes: u64) {
        if self.chunks.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            if let Some(flag) = self.flag.lock().unwrap().as_ref() {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    fn started(&self, _remote: &str, direction: TransferDirection, _total: u64, _resumed_at: u64) {
        assert_eq!(direction, TransferDirection::Upload);
    }
}

#[test]
fn cancelled_upload_is_resumable() {
    let server = server();
    let (mut session, seen, _) = login(&server, chunked(1000));
    let listener = Arc::new(CancelAfter {
        flag: Mutex::new(Some(session.cancel_handle())),
        chunks: AtomicU64::new(0),
        after: 2,
    });
    session.set_listener(listener);

    let local = server.dir.path().join("src.bin");
    let content = pattern(3500);
    std::fs::write(&local, &content).unwrap();

    let err = session.upload_file(&local, "c.bin").unwrap_err();
    assert!(matches!(err, FilegateError::Cancelled));
    assert_eq!(count(&seen, "upload").len(), 2);

    session.upload_file(&local, "c.bin").unwrap();
    assert_eq!(count(&seen, "upload").len(), 4);
    assert_eq!(std::fs::read(server.dir.path().join("c.bin")).unwrap(), content);
}

#[test]
fn file_actions_round_trip() {
    let server = server();
    let (mut session, _, _) = login(&server, SessionOptions::default());

    assert!(!session.exists("notes.txt").unwrap());
    assert_eq!(session.file_length("notes.txt").unwrap(), 0);
    session.upload_stream(Cursor::new(b"hello".to_vec()), 5, "notes.txt").unwrap();
    assert!(session.exists("notes.txt").unwrap());
    assert_eq!(session.file_length("notes.txt").unwrap(), 5);
    assert_eq!(session.list_files(".").unwrap(), vec!["notes.txt"]);
    assert!(session.remote_version().unwrap().starts_with("filegate/"));
    assert!(session.delete("notes.txt").unwrap());
    assert!(!session.delete("notes.txt").unwrap());

    let err = session.download_stream("notes.txt").unwrap_err();
    assert!(matches!(err, FilegateError::Remote { .. }), "{:?}", err);

    let err = session.exists("../outside").unwrap_err();
    assert!(matches!(err, FilegateError::SecurityError(_)), "{:?}", err);
}

#[test]
fn empty_file_transfers() {
    let server = server();
    let (mut session, _, _) = login(&server, chunked(1000));

    session.upload_stream(Cursor::new(Vec::new()), 0, "empty.bin").unwrap();
    assert_eq!(std::fs::read(server.dir.path().join("empty.bin")).unwrap(), b"");

    let mut out = Vec::new();
    assert_eq!(session.download("empty.bin", &mut out).unwrap(), 0);
    assert!(out.is_empty());
}

#[test]
fn whitelist_takes_precedence_over_blacklist() {
    let local: IpAddr = "127.0.0.1".parse().unwrap();
    let server = server_with(
        SecurityPolicy::new()
            .with_whitelist(["127.0.0.0/8".parse().unwrap()])
            .with_blacklist(["127.0.0.1".parse().unwrap()]),
    );
    assert!(Session::establish_with(
        URL,
        Some(Credentials::new("u1", "pw1")),
        SessionOptions::default(),
        Box::new(LoopbackTransport::with_client_ip(Arc::clone(&server.dispatcher), local)),
    )
    .is_ok());

    let outsider: IpAddr = "10.9.9.9".parse().unwrap();
    let err = Session::establish_with(
        URL,
        Some(Credentials::new("u1", "pw1")),
        SessionOptions::default(),
        Box::new(LoopbackTransport::with_client_ip(Arc::clone(&server.dispatcher), outsider)),
    )
    .unwrap_err();
    assert!(err.is_authentication_error());
}

#[test]
fn session_closed_after_logoff_and_cloned_sessions() {
    let server = server();
    let (mut session, _, _) = login(&server, SessionOptions::default());

    let mut other = session.try_clone().unwrap();
    assert_eq!(other.call("whoami", &[]).unwrap(), "u1");

    session.logoff();
    assert!(session.is_closed());
    assert!(matches!(session.call("whoami", &[]), Err(FilegateError::SessionClosed)));
    assert!(matches!(session.try_clone(), Err(FilegateError::SessionClosed)));
    assert_eq!(other.call("whoami", &[]).unwrap(), "u1");
}

#[test]
fn concurrent_sessions_upload_in_parallel() {
    let server = server();
    let (session, _, _) = login(&server, chunked(700));

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let mut session = session.try_clone().unwrap();
            std::thread::spawn(move || {
                let content = pattern(2000 + n * 100);
                session
                    .upload_stream(Cursor::new(content.clone()), content.len() as u64, &format!("p{}.bin", n))
                    .unwrap();
                content
            })
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        let content = handle.join().unwrap();
        assert_eq!(std::fs::read(server.dir.path().join(format!("p{}.bin", n))).unwrap(), content);
    }
}

/// Loopback transport replacing the token of every download request
#[derive(Clone)]
struct ForgedDownloadToken(LoopbackTransport);

impl Transport for ForgedDownloadToken {
    fn execute(&mut self, mut request: HttpRequest) -> Result<HttpResponse> {
        if let RequestBody::Form(fields) = &mut request.body {
            let downloading = fields.iter().any(|(k, v)| k == param::ACTION && v == "download");
            for (name, value) in fields.iter_mut() {
                if downloading && name.as_str() == param::TOKEN {
                    *value = "deadbeef".to_string();
                }
            }
        }
        self.0.execute(request)
    }

    fn duplicate(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self.clone()))
    }
}

#[test]
fn rejected_download_of_marker_sized_chunk() {
    let server = server();
    let content = b"exactly twenty-five bytes";
    assert_eq!(content.len(), INVALID_LOGIN_OR_PASSWORD.len());
    std::fs::write(server.dir.path().join("short.txt"), content).unwrap();

    let mut session = Session::establish_with(
        URL,
        Some(Credentials::new("u1", "pw1")),
        SessionOptions::default(),
        Box::new(ForgedDownloadToken(LoopbackTransport::new(Arc::clone(&server.dispatcher)))),
    )
    .unwrap();

    let mut fetched = Vec::new();
    let err = session.download("short.txt", &mut fetched).unwrap_err();
    assert!(matches!(err, FilegateError::SessionClosed), "{:?}", err);
    assert!(fetched.is_empty());
}

#[test]
fn anonymous_session_calls_listed_methods() {
    let server = server();
    let dispatcher = Dispatcher::builder(SECRET)
        .methods(builtin_methods())
        .anonymous_methods(["echo"])
        .resolver(Arc::new(RootDirectoryResolver::new(server.dir.path(), false)))
        .build()
        .unwrap();

    let mut session = Session::establish_with(
        URL,
        None,
        SessionOptions::default(),
        Box::new(LoopbackTransport::new(Arc::new(dispatcher))),
    )
    .unwrap();
    assert!(!session.is_authenticated());

    assert_eq!(session.call("echo", &[RpcValue::from("hi")]).unwrap(), "hi");
    let err = session.call("whoami", &[]).unwrap_err();
    assert!(matches!(err, FilegateError::AuthenticationError { .. }), "{:?}", err);
    let err = session.remote_version().unwrap_err();
    assert!(err.is_authentication_error());
}
