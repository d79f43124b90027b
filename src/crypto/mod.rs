//! Encryption module
//!
//! Optional symmetric encryption of request parameter values, for
//! deployments where the transport itself is not trusted.

mod encryption;

pub use encryption::*;
