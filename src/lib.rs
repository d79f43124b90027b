//! # Filegate - authenticated file transfer and remote calls over HTTP(S)
//!
//! A client library and a small server speaking one stateless protocol:
//! every exchange is a single HTTP POST with form parameters (multipart for
//! uploads) and a textual response envelope.
//!
//! ## Features
//!
//! - **Token authentication**: login once, then a deterministic token
//!   derived from the username and a server secret accompanies each request
//! - **Security gate**: banned usernames, IP whitelist/blacklist, per-call
//!   authorization with an audit hook, throttled failed logins
//! - **Remote calls**: typed arguments, HTML-escaped or legacy base64 wire
//!   encoding, structured remote errors
//! - **Chunked transfers**: uploads and downloads in fixed-size chunks,
//!   resumable within the process after a transport failure
//! - **Parameter encryption**: optional shared-password encryption of every
//!   parameter value
//!
//! ## Client
//!
//! ```no_run
//! use filegate::client::{Credentials, Session, SessionOptions};
//! use filegate::rpc::RpcValue;
//!
//! let mut session = Session::establish(
//!     "https://files.example.com/filegate",
//!     Some(Credentials::new("alice", "secret")),
//!     SessionOptions::default(),
//! )?;
//!
//! let sum = session.call("add", &[RpcValue::from(33), RpcValue::from(44)])?;
//! assert_eq!(sum, "77");
//!
//! session.upload_file("report.pdf", "docs/report.pdf")?;
//! session.download_file("docs/report.pdf", "copy.pdf")?;
//! # Ok::<(), filegate::FilegateError>(())
//! ```
//!
//! ## Embedded server
//!
//! ```no_run
//! use filegate::server::{
//!     builtin_methods, Dispatcher, HttpServer, HttpServerConfig, RootDirectoryResolver,
//!     StaticCredentials,
//! };
//! use std::sync::Arc;
//!
//! let dispatcher = Dispatcher::builder("server-secret")
//!     .methods(builtin_methods())
//!     .credentials(Arc::new(StaticCredentials::new([("alice", "secret")])))
//!     .resolver(Arc::new(RootDirectoryResolver::new("/srv/filegate", true)))
//!     .build()?;
//!
//! HttpServer::bind(HttpServerConfig::default(), Arc::new(dispatcher))?.run()?;
//! # Ok::<(), filegate::FilegateError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod transfer;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use client::{Credentials, Session, SessionOptions};
pub use error::{FilegateError, Result};
pub use server::{Dispatcher, HttpServer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use filegate::prelude::*;
    //! ```

    pub use crate::client::{
        Credentials, Session, SessionOptions, TransferListener, Transport, TransportConfig,
    };
    pub use crate::error::{FilegateError, Result};
    pub use crate::progress::TransferProgress;
    pub use crate::rpc::{CallContext, EncodingMode, MethodRegistry, RpcValue};
    pub use crate::server::{
        CallPolicy, CredentialChecker, Dispatcher, HttpServer, LoginSpeedReducer, LoopbackTransport,
        SecurityPolicy, StoragePathResolver,
    };
}
