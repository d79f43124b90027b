//! Server side of the protocol
//!
//! - [`Dispatcher`]: decodes requests, enforces the token gate and routes
//!   actions to handlers
//! - [`SecurityGate`] and its collaborator traits, with stock
//!   implementations
//! - [`HttpServer`]: blocking HTTP listener
//! - [`LoopbackTransport`]: in-process client transport
//! - [`Cidr`]: subnet membership for the IP lists

mod builtin;
mod cidr;
mod defaults;
mod dispatcher;
mod http;
mod loopback;
mod multipart;
mod security;

pub use builtin::*;
pub use cidr::*;
pub use defaults::*;
pub use dispatcher::*;
pub use http::*;
pub use loopback::*;
pub use multipart::{boundary_of, read_multipart, MultipartForm, MultipartLimits};
pub use security::*;
