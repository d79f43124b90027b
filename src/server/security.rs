//! Security gate
//!
//! The host application supplies the collaborators at startup:
//! - [`CredentialChecker`]: password check at login
//! - [`CallPolicy`]: per-call authorization plus the refusal audit hook
//! - [`LoginSpeedReducer`]: slows down repeated failed logins
//! - [`StoragePathResolver`]: maps a user's relative path to a server path
//!
//! [`SecurityPolicy`] holds the static part: banned usernames and the IP
//! whitelist and blacklist. A non-empty whitelist is authoritative; the
//! blacklist is consulted only when the whitelist is empty.

use crate::error::Result;
use crate::rpc::RpcValue;
use crate::server::Cidr;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Password check performed at login
pub trait CredentialChecker: Send + Sync {
    /// Whether the password is valid for the user
    fn login(&self, username: &str, password: &str) -> bool;
}

/// Authorization of remote calls
pub trait CallPolicy: Send + Sync {
    /// Whether `username` may call `method` with `args`
    fn allow(&self, username: &str, method: &str, args: &[RpcValue]) -> bool;

    /// Audit hook run once for each refused call
    fn on_refused(&self, username: &str, client_ip: IpAddr, method: &str, args: &[RpcValue]);
}

/// Throttling of failed logins
pub trait LoginSpeedReducer: Send + Sync {
    /// Called after a failed login, before the client gets its reply
    fn record_failure(&self, username: &str);

    /// Called after a successful login
    fn record_success(&self, _username: &str) {}
}

/// Storage layout
pub trait StoragePathResolver: Send + Sync {
    /// Server path of `relative` for `username`
    fn resolve(&self, username: &str, relative: &str) -> Result<PathBuf>;
}

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// Username missing
    EmptyUsername,
    /// Username in the banned set
    Banned,
    /// Client address not admitted by the IP lists
    IpRejected,
}

/// Banned usernames and IP filters
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    banned: HashSet<String>,
    whitelist: Vec<Cidr>,
    blacklist: Vec<Cidr>,
}

impl SecurityPolicy {
    /// Create an open policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban usernames
    pub fn with_banned<I, S>(mut self, usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.banned.extend(usernames.into_iter().map(Into::into));
        self
    }

    /// Admit only these networks
    pub fn with_whitelist(mut self, networks: impl IntoIterator<Item = Cidr>) -> Self {
        self.whitelist.extend(networks);
        self
    }

    /// Reject these networks (ignored when a whitelist is set)
    pub fn with_blacklist(mut self, networks: impl IntoIterator<Item = Cidr>) -> Self {
        self.blacklist.extend(networks);
        self
    }

    /// Exact-match ban check
    pub fn is_banned(&self, username: &str) -> bool {
        self.banned.contains(username)
    }

    /// Whether the address passes the IP lists
    pub fn admits_ip(&self, ip: &IpAddr) -> bool {
        if !self.whitelist.is_empty() {
            return self.whitelist.iter().any(|net| net.contains(ip));
        }
        !self.blacklist.iter().any(|net| net.contains(ip))
    }

    /// Ban and IP checks together
    pub fn check(&self, username: &str, ip: &IpAddr) -> std::result::Result<(), Refusal> {
        if username.is_empty() {
            return Err(Refusal::EmptyUsername);
        }
        if self.is_banned(username) {
            return Err(Refusal::Banned);
        }
        if !self.admits_ip(ip) {
            return Err(Refusal::IpRejected);
        }
        Ok(())
    }
}

/// Policy plus collaborators, consulted by the dispatcher
#[derive(Clone)]
pub struct SecurityGate {
    policy: SecurityPolicy,
    credentials: Arc<dyn CredentialChecker>,
    calls: Arc<dyn CallPolicy>,
    reducer: Arc<dyn LoginSpeedReducer>,
}

impl SecurityGate {
    /// Create a gate
    pub fn new(
        policy: SecurityPolicy,
        credentials: Arc<dyn CredentialChecker>,
        calls: Arc<dyn CallPolicy>,
        reducer: Arc<dyn LoginSpeedReducer>,
    ) -> Self {
        Self {
            policy,
            credentials,
            calls,
            reducer,
        }
    }

    /// Static policy
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Ban and IP checks for an identified request
    pub fn admit(&self, username: &str, ip: IpAddr) -> std::result::Result<(), Refusal> {
        self.policy.check(username, &ip).map_err(|refusal| {
            warn!("Refused {} from {}: {:?}", username, ip, refusal);
            refusal
        })
    }

    /// Full login check; failures go through the login speed reducer
    pub fn login(&self, username: &str, password: &str, ip: IpAddr) -> bool {
        if self.admit(username, ip).is_err() {
            return false;
        }

        if self.credentials.login(username, password) {
            self.reducer.record_success(username);
            true
        } else {
            warn!("Failed login for {} from {}", username, ip);
            self.reducer.record_failure(username);
            false
        }
    }

    /// Call authorization; a refusal runs the audit hook
    pub fn authorize_call(&self, username: &str, ip: IpAddr, method: &str, args: &[RpcValue]) -> bool {
        if self.calls.allow(username, method, args) {
            return true;
        }
        warn!("Refused call {} by {} from {}", method, username, ip);
        self.calls.on_refused(username, ip, method, args);
        false
    }
}

impl std::fmt::Debug for SecurityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGate")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AllowAll, NoDelay, StaticCredentials};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn nets(list: &[&str]) -> Vec<Cidr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_whitelist_wins_over_blacklist() {
        let policy = SecurityPolicy::new()
            .with_whitelist(nets(&["10.0.0.0/8"]))
            .with_blacklist(nets(&["10.1.2.3"]));
        assert!(policy.admits_ip(&ip("10.1.2.3")));
        assert!(!policy.admits_ip(&ip("192.168.0.1")));
    }

    #[test]
    fn test_blacklist_without_whitelist() {
        let policy = SecurityPolicy::new().with_blacklist(nets(&["192.168.0.0/16"]));
        assert!(!policy.admits_ip(&ip("192.168.4.4")));
        assert!(policy.admits_ip(&ip("10.0.0.1")));
        assert!(SecurityPolicy::new().admits_ip(&ip("10.0.0.1")));
    }

    #[test]
    fn test_ban_is_exact() {
        let policy = SecurityPolicy::new().with_banned(["mallory"]);
        let local = ip("127.0.0.1");
        assert_eq!(policy.check("mallory", &local), Err(Refusal::Banned));
        assert_eq!(policy.check("Mallory", &local), Ok(()));
        assert_eq!(policy.check("", &local), Err(Refusal::EmptyUsername));
    }

    #[test]
    fn test_gate_login() {
        let gate = SecurityGate::new(
            SecurityPolicy::new().with_banned(["mallory"]),
            Arc::new(StaticCredentials::new([("u1", "pw"), ("mallory", "pw")])),
            Arc::new(AllowAll),
            Arc::new(NoDelay),
        );
        let local = ip("127.0.0.1");
        assert!(gate.login("u1", "pw", local));
        assert!(!gate.login("u1", "nope", local));
        assert!(!gate.login("mallory", "pw", local));
    }
}
