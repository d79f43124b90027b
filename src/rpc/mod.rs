//! Remote method calls
//!
//! - [`RpcValue`] / [`ArgKind`]: the closed set of argument kinds
//! - [`RpcInvocation`] / [`EncodingMode`]: wire marshalling
//! - [`MethodRegistry`]: server-side handlers

mod invocation;
mod registry;
mod value;

pub use invocation::*;
pub use registry::*;
pub use value::*;
