//! Request parameter codec
//!
//! Sits between the request builders and the transport on the client, and
//! between the HTTP listener and the dispatcher on the server.

mod params;

pub use params::*;
