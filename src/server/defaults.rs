//! Stock implementations of the security collaborators

use crate::error::{FilegateError, Result};
use crate::rpc::RpcValue;
use crate::server::{CallPolicy, CredentialChecker, LoginSpeedReducer, StoragePathResolver};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Fixed user table
#[derive(Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    /// Build from (username, password) pairs
    pub fn new<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            users: users
                .into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        }
    }

    /// Number of users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialChecker for StaticCredentials {
    fn login(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .map(|expected| bool::from(expected.as_bytes().ct_eq(password.as_bytes())))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut users: Vec<&str> = self.users.keys().map(String::as_str).collect();
        users.sort_unstable();
        f.debug_struct("StaticCredentials").field("users", &users).finish()
    }
}

/// Call policy admitting everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CallPolicy for AllowAll {
    fn allow(&self, _username: &str, _method: &str, _args: &[RpcValue]) -> bool {
        true
    }

    fn on_refused(&self, _username: &str, _client_ip: IpAddr, _method: &str, _args: &[RpcValue]) {}
}

/// One refused call
#[derive(Debug, Clone, PartialEq)]
pub struct RefusedCall {
    /// When the call was refused
    pub at: DateTime<Utc>,
    /// Caller
    pub username: String,
    /// Caller address
    pub client_ip: IpAddr,
    /// Method
    pub method: String,
    /// Arguments as `kind:value`
    pub args: Vec<String>,
}

/// Call policy admitting only listed methods, keeping an audit trail of
/// refusals
///
/// The trail holds the most recent refusals only; every refusal is also
/// logged as it happens.
#[derive(Debug)]
pub struct MethodAllowList {
    allowed: HashSet<String>,
    audit: Mutex<VecDeque<RefusedCall>>,
    audit_limit: usize,
}

impl MethodAllowList {
    /// Refusals kept by default
    pub const DEFAULT_AUDIT_LIMIT: usize = 1024;

    /// Allow exactly these methods
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: methods.into_iter().map(Into::into).collect(),
            audit: Mutex::new(VecDeque::new()),
            audit_limit: Self::DEFAULT_AUDIT_LIMIT,
        }
    }

    /// Keep at most `limit` refusals
    pub fn with_audit_limit(mut self, limit: usize) -> Self {
        self.audit_limit = limit;
        self
    }

    /// Recent refusals, oldest first
    pub fn refused(&self) -> Vec<RefusedCall> {
        self.audit
            .lock()
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MethodAllowList {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl CallPolicy for MethodAllowList {
    fn allow(&self, _username: &str, method: &str, _args: &[RpcValue]) -> bool {
        self.allowed.contains(method)
    }

    fn on_refused(&self, username: &str, client_ip: IpAddr, method: &str, args: &[RpcValue]) {
        let entry = RefusedCall {
            at: Utc::now(),
            username: username.to_string(),
            client_ip,
            method: method.to_string(),
            args: args.iter().map(|a| format!("{}:{}", a.kind(), a.to_wire())).collect(),
        };
        warn!(
            "AUDIT {} refused {}({}) for {} from {}",
            entry.at.to_rfc3339(),
            entry.method,
            entry.args.join(", "),
            entry.username,
            entry.client_ip
        );
        if let Ok(mut audit) = self.audit.lock() {
            if self.audit_limit == 0 {
                return;
            }
            while audit.len() >= self.audit_limit {
                audit.pop_front();
            }
            audit.push_back(entry);
        }
    }
}

/// Login speed reducer sleeping `base * 2^(failures-1)`, capped
///
/// Failure counts are forgotten once a name has had no failed login for
/// `forget_after`. The table never tracks more than `max_tracked` names;
/// the least recently failing name makes room for a new one.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    forget_after: Duration,
    max_tracked: usize,
    failures: Mutex<HashMap<String, Failures>>,
}

#[derive(Debug, Clone, Copy)]
struct Failures {
    count: u32,
    last: Instant,
}

impl ExponentialBackoff {
    /// Quiet period after which a name's failures are forgotten
    pub const DEFAULT_FORGET_AFTER: Duration = Duration::from_secs(15 * 60);

    /// Names tracked by default
    pub const DEFAULT_MAX_TRACKED: usize = 10_000;

    /// Create a reducer
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            forget_after: Self::DEFAULT_FORGET_AFTER,
            max_tracked: Self::DEFAULT_MAX_TRACKED,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Forget a name's failures after `quiet` without a failed login
    pub fn with_forget_after(mut self, quiet: Duration) -> Self {
        self.forget_after = quiet;
        self
    }

    /// Track at most `max` names
    pub fn with_max_tracked(mut self, max: usize) -> Self {
        self.max_tracked = max.max(1);
        self
    }

    /// Delay the next failure of `username` will incur
    pub fn next_delay(&self, username: &str) -> Duration {
        self.delay_for(self.failures(username) + 1)
    }

    /// Failures currently counted against `username`
    pub fn failures(&self, username: &str) -> u32 {
        self.failures
            .lock()
            .map(|table| {
                table
                    .get(username)
                    .filter(|f| f.last.elapsed() < self.forget_after)
                    .map(|f| f.count)
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Number of names with failures on record
    pub fn tracked(&self) -> usize {
        self.failures.lock().map(|table| table.len()).unwrap_or(0)
    }

    fn record(&self, table: &mut HashMap<String, Failures>, username: &str) -> u32 {
        let forget_after = self.forget_after;
        table.retain(|_, f| f.last.elapsed() < forget_after);

        if !table.contains_key(username) {
            while table.len() >= self.max_tracked {
                let oldest = table
                    .iter()
                    .min_by_key(|(_, f)| f.last)
                    .map(|(name, _)| name.clone());
                match oldest {
                    Some(name) => table.remove(&name),
                    None => break,
                };
            }
        }

        let entry = table.entry(username.to_string()).or_insert(Failures {
            count: 0,
            last: Instant::now(),
        });
        entry.count = entry.count.saturating_add(1);
        entry.last = Instant::now();
        entry.count
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl LoginSpeedReducer for ExponentialBackoff {
    fn record_failure(&self, username: &str) {
        let failures = match self.failures.lock() {
            Ok(mut table) => self.record(&mut table, username),
            Err(_) => 1,
        };
        let delay = self.delay_for(failures);
        debug!("Delaying reply to {} by {:?} ({} failures)", username, delay, failures);
        std::thread::sleep(delay);
    }

    fn record_success(&self, username: &str) {
        if let Ok(mut table) = self.failures.lock() {
            table.remove(username);
        }
    }
}

/// Login speed reducer that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl LoginSpeedReducer for NoDelay {
    fn record_failure(&self, _username: &str) {}
}

/// Files live under one root, optionally in one directory per user
#[derive(Debug, Clone)]
pub struct RootDirectoryResolver {
    root: PathBuf,
    per_user: bool,
}

impl RootDirectoryResolver {
    /// Create a resolver
    pub fn new(root: impl Into<PathBuf>, per_user: bool) -> Self {
        Self {
            root: root.into(),
            per_user,
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StoragePathResolver for RootDirectoryResolver {
    fn resolve(&self, username: &str, relative: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();

        if self.per_user {
            let mut parts = Path::new(username).components();
            match (parts.next(), parts.next()) {
                (Some(Component::Normal(name)), None) => path.push(name),
                _ => {
                    return Err(FilegateError::SecurityError(format!(
                        "username '{}' cannot be used as a directory",
                        username
                    )))
                }
            }
        }

        for component in Path::new(relative.trim()).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(FilegateError::SecurityError(format!(
                        "path '{}' escapes the storage root",
                        relative
                    )))
                }
            }
        }
        Ok(path)
    }
}
