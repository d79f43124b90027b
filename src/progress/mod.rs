//! Progress reporting for transfers
//!
//! [`TransferProgress`] renders an indicatif bar driven by the transfer
//! engine's listener hook.

mod reporter;

pub use reporter::*;
