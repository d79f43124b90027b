//! Client side of the protocol
//!
//! - [`Session`]: login, token lifecycle, remote calls and file actions
//! - [`Transport`] / [`HttpTransport`]: the HTTP collaborator
//! - [`ServerReply`]: spooled reply reception
//! - chunked, resumable uploads and downloads on [`Session`]

mod response;
mod session;
mod transfer;
mod transport;

pub use response::*;
pub use session::{Credentials, Session, SessionOptions};
pub use transfer::*;
pub use transport::*;
