//! Configuration settings for Filegate
//!
//! Command-line arguments for the client subcommands and the JSON settings
//! file read by `filegate serve`.

use crate::client::{Credentials, ProxyConfig, SessionOptions, TransportConfig};
use crate::error::{FilegateError, IoResultExt, Result};
use crate::rpc::{EncodingMode, MethodRegistry};
use crate::server::{
    AllowAll, CallPolicy, Cidr, Dispatcher, ExponentialBackoff, HttpServerConfig, MethodAllowList,
    RootDirectoryResolver, SecurityPolicy, StaticCredentials,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Filegate - authenticated file transfer and remote calls over HTTP(S)
#[derive(Parser, Debug, Clone)]
#[command(name = "filegate")]
#[command(author = "Filegate Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Stateless authenticated file transfer and remote method calls over HTTP(S)")]
#[command(long_about = r#"
Filegate runs a small HTTP(S) service that authenticates users, executes
whitelisted server-side methods and moves files in resumable chunks.

Examples:
  filegate serve --config server.json
  filegate call add int:33 int:44 --url http://localhost:8080/filegate -u alice
  filegate upload ./report.pdf docs/report.pdf --chunk-size 4M
  filegate download docs/report.pdf ./copy.pdf
"#)]
pub struct CliArgs {
    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP server
    #[command(name = "serve")]
    Serve {
        /// Server settings file (JSON)
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,

        /// Override the bind address from the settings file
        #[arg(long, value_name = "ADDR")]
        bind: Option<SocketAddr>,
    },

    /// Call a remote method; arguments are `kind:value` (plain text is a string)
    #[command(name = "call")]
    Call {
        #[command(flatten)]
        client: ClientArgs,

        /// Method name
        method: String,

        /// Arguments, e.g. int:33 string:hello boolean:true
        #[arg(value_name = "ARG")]
        args: Vec<String>,
    },

    /// Upload a local file
    #[command(name = "upload")]
    Upload {
        #[command(flatten)]
        client: ClientArgs,

        /// Local file
        local: PathBuf,

        /// Remote path
        remote: String,
    },

    /// Download a remote file
    #[command(name = "download")]
    Download {
        #[command(flatten)]
        client: ClientArgs,

        /// Remote path
        remote: String,

        /// Local file
        local: PathBuf,
    },

    /// Print the server version
    #[command(name = "version")]
    Version {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Check whether a remote file exists
    #[command(name = "exists")]
    Exists {
        #[command(flatten)]
        client: ClientArgs,

        /// Remote path
        remote: String,
    },

    /// Delete a remote file
    #[command(name = "delete")]
    Delete {
        #[command(flatten)]
        client: ClientArgs,

        /// Remote path
        remote: String,
    },

    /// List a remote directory
    #[command(name = "ls")]
    Ls {
        #[command(flatten)]
        client: ClientArgs,

        /// Remote directory
        #[arg(default_value = ".")]
        remote: String,
    },
}

/// Log line format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Connection options shared by the client subcommands
#[derive(Args, Clone)]
pub struct ClientArgs {
    /// Server URL
    #[arg(long, env = "FILEGATE_URL", value_name = "URL")]
    pub url: String,

    /// Login name
    #[arg(short = 'u', long, env = "FILEGATE_USERNAME")]
    pub username: Option<String>,

    /// Password
    #[arg(long, env = "FILEGATE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Shared parameter encryption password
    #[arg(long, env = "FILEGATE_ENCRYPTION_PASSWORD", hide_env_values = true)]
    pub encryption_password: Option<String>,

    /// Chunk size for transfers (e.g., 10M, 512K; 0 disables chunking)
    #[arg(long, default_value = "10M", value_name = "SIZE")]
    pub chunk_size: String,

    /// Use the legacy base64 call encoding
    #[arg(long)]
    pub legacy_encoding: bool,

    /// Connection timeout (e.g., 15s)
    #[arg(long, default_value = "15s", value_name = "DURATION")]
    pub connect_timeout: String,

    /// Whole-request timeout (e.g., 5m)
    #[arg(long, value_name = "DURATION")]
    pub read_timeout: Option<String>,

    /// HTTP proxy URL
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    /// Proxy user
    #[arg(long, requires = "proxy")]
    pub proxy_user: Option<String>,

    /// Proxy password
    #[arg(long, requires = "proxy", env = "FILEGATE_PROXY_PASSWORD", hide_env_values = true)]
    pub proxy_password: Option<String>,

    /// Retries for idempotent requests that fail to connect
    #[arg(long, default_value = "2", value_name = "NUM")]
    pub retries: u32,

    /// Show a progress bar for transfers
    #[arg(short = 'p', long)]
    pub progress: bool,
}

impl ClientArgs {
    /// Session options from the command line
    pub fn session_options(&self) -> Result<SessionOptions> {
        let chunk_length = parse_size(&self.chunk_size)
            .map_err(|e| FilegateError::config(format!("Invalid chunk size: {}", e)))?;
        let connect_timeout = parse_duration(&self.connect_timeout)?;
        let read_timeout = self.read_timeout.as_deref().map(parse_duration).transpose()?;

        let proxy = self.proxy.as_ref().map(|url| ProxyConfig {
            url: url.clone(),
            username: self.proxy_user.clone(),
            password: self.proxy_password.clone(),
        });

        Ok(SessionOptions {
            encryption_password: self.encryption_password.clone(),
            chunk_length,
            encoding_mode: if self.legacy_encoding {
                EncodingMode::LegacyBase64
            } else {
                EncodingMode::HtmlEncoded
            },
            transport: TransportConfig {
                connect_timeout,
                read_timeout,
                proxy,
                max_retries: self.retries,
                ..Default::default()
            },
        })
    }

    /// Credentials, when a username was given
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Some(Credentials::new(username, password))),
            (Some(username), None) => Err(FilegateError::config(format!(
                "no password for '{}' (use --password or FILEGATE_PASSWORD)",
                username
            ))),
            (None, _) => Ok(None),
        }
    }
}

impl fmt::Debug for ClientArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientArgs")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("chunk_size", &self.chunk_size)
            .field("legacy_encoding", &self.legacy_encoding)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

/// Login throttling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginBackoffSettings {
    /// Delay after the first failure (e.g., "500ms"); "0s" disables throttling
    pub base: String,
    /// Longest delay
    pub cap: String,
    /// Quiet period after which a name's failures are forgotten
    pub forget_after: String,
}

impl Default for LoginBackoffSettings {
    fn default() -> Self {
        Self {
            base: "500ms".to_string(),
            cap: "30s".to_string(),
            forget_after: "15m".to_string(),
        }
    }
}

/// Server settings file
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub bind: IpAddr,
    /// Port
    pub port: u16,
    /// Token derivation secret (required)
    pub secret: String,
    /// Shared parameter encryption password
    pub encryption_password: Option<String>,
    /// Ask clients to refuse plain http
    pub force_secure: bool,
    /// Storage root
    pub root: PathBuf,
    /// One sub-directory per user under the root
    pub per_user_directories: bool,
    /// Usernames refused at login and on every request
    pub banned_usernames: Vec<String>,
    /// Admitted networks; when non-empty the blacklist is ignored
    pub ip_whitelist: Vec<Cidr>,
    /// Rejected networks
    pub ip_blacklist: Vec<Cidr>,
    /// Username to password
    pub users: BTreeMap<String, String>,
    /// Methods clients may call; all registered methods when absent
    pub allowed_methods: Option<Vec<String>>,
    /// Methods callable without logging in; none by default
    pub anonymous_methods: Vec<String>,
    /// Failed-login throttling
    pub login_backoff: LoginBackoffSettings,
    /// Maximum size of the text parameters of one request (e.g., "2M")
    pub max_form_size: String,
    /// Maximum size of one uploaded chunk (e.g., "11M")
    pub max_upload_size: String,
    /// Idle period after which an unfinished chunked upload is discarded (e.g., "1h")
    pub abandoned_upload_ttl: String,
    /// Socket read timeout (e.g., "60s")
    pub read_timeout: String,
    /// Send server-side error chains to clients
    pub expose_traces: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([127, 0, 0, 1]),
            port: 8080,
            secret: String::new(),
            encryption_password: None,
            force_secure: false,
            root: PathBuf::from("filegate-data"),
            per_user_directories: false,
            banned_usernames: Vec::new(),
            ip_whitelist: Vec::new(),
            ip_blacklist: Vec::new(),
            users: BTreeMap::new(),
            allowed_methods: None,
            anonymous_methods: Vec::new(),
            login_backoff: LoginBackoffSettings::default(),
            max_form_size: "2M".to_string(),
            max_upload_size: "11M".to_string(),
            abandoned_upload_ttl: "1h".to_string(),
            read_timeout: "60s".to_string(),
            expose_traces: false,
        }
    }
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("force_secure", &self.force_secure)
            .field("encrypted", &self.encryption_password.is_some())
            .field("root", &self.root)
            .field("per_user_directories", &self.per_user_directories)
            .field("banned_usernames", &self.banned_usernames)
            .field("ip_whitelist", &self.ip_whitelist)
            .field("ip_blacklist", &self.ip_blacklist)
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .field("allowed_methods", &self.allowed_methods)
            .field("anonymous_methods", &self.anonymous_methods)
            .field("login_backoff", &self.login_backoff)
            .field("max_form_size", &self.max_form_size)
            .field("max_upload_size", &self.max_upload_size)
            .field("abandoned_upload_ttl", &self.abandoned_upload_ttl)
            .field("expose_traces", &self.expose_traces)
            .finish_non_exhaustive()
    }
}

impl ServerSettings {
    /// Read and validate a settings file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_path(path)?;
        let settings: Self = serde_json::from_str(&text)
            .map_err(|e| FilegateError::config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.secret.trim().is_empty() {
            return Err(FilegateError::config("'secret' must be set"));
        }
        if self.users.keys().any(|u| u.trim().is_empty() || u.trim() != u) {
            return Err(FilegateError::config(
                "usernames must be non-empty and without surrounding whitespace",
            ));
        }
        if self.login_delays()?.0 > self.login_delays()?.1 {
            return Err(FilegateError::config("login_backoff.base exceeds login_backoff.cap"));
        }
        self.http_config()?;
        parse_duration(&self.login_backoff.forget_after)?;
        parse_duration(&self.abandoned_upload_ttl)?;
        Ok(())
    }

    /// Listener configuration
    pub fn http_config(&self) -> Result<HttpServerConfig> {
        let max_form_size = parse_size(&self.max_form_size)
            .map_err(|e| FilegateError::config(format!("Invalid max_form_size: {}", e)))?;
        let max_upload_size = parse_size(&self.max_upload_size)
            .map_err(|e| FilegateError::config(format!("Invalid max_upload_size: {}", e)))?;
        Ok(HttpServerConfig {
            bind: SocketAddr::new(self.bind, self.port),
            max_form_size: usize::try_from(max_form_size)
                .map_err(|_| FilegateError::config("max_form_size too large"))?,
            max_upload_size,
            read_timeout: parse_duration(&self.read_timeout)?,
        })
    }

    fn login_delays(&self) -> Result<(Duration, Duration)> {
        Ok((
            parse_duration(&self.login_backoff.base)?,
            parse_duration(&self.login_backoff.cap)?,
        ))
    }

    /// Build the dispatcher serving `methods`
    pub fn dispatcher(&self, methods: MethodRegistry) -> Result<Dispatcher> {
        let policy = SecurityPolicy::new()
            .with_banned(self.banned_usernames.iter().cloned())
            .with_whitelist(self.ip_whitelist.iter().copied())
            .with_blacklist(self.ip_blacklist.iter().copied());

        let calls: Arc<dyn CallPolicy> = match &self.allowed_methods {
            Some(allowed) => Arc::new(MethodAllowList::new(allowed.iter().cloned())),
            None => Arc::new(AllowAll),
        };
        let (base, cap) = self.login_delays()?;
        let backoff = ExponentialBackoff::new(base, cap)
            .with_forget_after(parse_duration(&self.login_backoff.forget_after)?);

        Dispatcher::builder(self.secret.clone())
            .encryption_password(self.encryption_password.clone())
            .force_secure(self.force_secure)
            .methods(methods)
            .anonymous_methods(self.anonymous_methods.iter().cloned())
            .policy(policy)
            .credentials(Arc::new(StaticCredentials::new(self.users.clone())))
            .call_policy(calls)
            .login_speed_reducer(Arc::new(backoff))
            .resolver(Arc::new(RootDirectoryResolver::new(
                self.root.clone(),
                self.per_user_directories,
            )))
            .abandoned_upload_ttl(parse_duration(&self.abandoned_upload_ttl)?)
            .expose_traces(self.expose_traces)
            .build()
    }
}

/// Parse human-readable size string to bytes
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("GB") || size.ends_with('G') {
        (size.trim_end_matches(|c| c == 'G' || c == 'B'), 1024u64 * 1024 * 1024)
    } else if size.ends_with("MB") || size.ends_with('M') {
        (size.trim_end_matches(|c| c == 'M' || c == 'B'), 1024u64 * 1024)
    } else if size.ends_with("KB") || size.ends_with('K') {
        (size.trim_end_matches(|c| c == 'K' || c == 'B'), 1024u64)
    } else {
        (size.trim_end_matches('B'), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Invalid size: {}", size));
    }

    Ok((num * multiplier as f64) as u64)
}

/// Parse a duration such as `15s`, `500ms` or `2m`
pub fn parse_duration(text: &str) -> Result<Duration> {
    humantime::parse_duration(text.trim())
        .map_err(|e| FilegateError::config(format!("Invalid duration '{}': {}", text, e)))
}
