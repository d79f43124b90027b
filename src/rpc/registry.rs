//! Server-side method registry
//!
//! The host application registers its callable methods by name at startup.
//! Handlers receive the typed arguments and return the textual result.

use crate::protocol::{RemoteErrorKind, RemoteFailure};
use crate::rpc::RpcValue;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Caller information passed to handlers
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    /// Authenticated username
    pub username: &'a str,
    /// Client address
    pub client_ip: IpAddr,
}

/// A registered remote method
pub type MethodHandler =
    Arc<dyn Fn(&CallContext<'_>, &[RpcValue]) -> anyhow::Result<String> + Send + Sync>;

/// Registry of callable methods
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodHandler>,
}

impl MethodRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method, replacing any previous one with the same name
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&CallContext<'_>, &[RpcValue]) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    /// Builder-style [`Self::register`]
    pub fn with<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CallContext<'_>, &[RpcValue]) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.register(name, handler);
        self
    }

    /// Whether a method is registered
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke a method
    ///
    /// Handler errors become `application` failures carrying the error chain
    /// as the remote trace, unless the handler returned a [`RemoteFailure`]
    /// itself.
    pub fn invoke(
        &self,
        context: &CallContext<'_>,
        method: &str,
        args: &[RpcValue],
    ) -> Result<String, RemoteFailure> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| RemoteFailure::new(RemoteErrorKind::MethodNotFound, method))?;

        handler(context, args).map_err(|err| match err.downcast::<RemoteFailure>() {
            Ok(failure) => failure,
            Err(err) => RemoteFailure::new(RemoteErrorKind::Application, err.to_string())
                .with_trace(format!("{:?}", err)),
        })
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

fn arg<'a>(args: &'a [RpcValue], index: usize) -> anyhow::Result<&'a RpcValue> {
    args.get(index).ok_or_else(|| {
        RemoteFailure::new(
            RemoteErrorKind::InvalidArgument,
            format!("missing argument {}", index),
        )
        .into()
    })
}

fn mismatch(index: usize, expected: &str, found: &RpcValue) -> anyhow::Error {
    RemoteFailure::new(
        RemoteErrorKind::InvalidArgument,
        format!("argument {} must be {}, got {}", index, expected, found.kind()),
    )
    .into()
}

/// Integer argument at `index`
pub fn int_arg(args: &[RpcValue], index: usize) -> anyhow::Result<i64> {
    let value = arg(args, index)?;
    value.as_i64().ok_or_else(|| mismatch(index, "an integer", value))
}

/// Numeric argument at `index`
pub fn float_arg(args: &[RpcValue], index: usize) -> anyhow::Result<f64> {
    let value = arg(args, index)?;
    value.as_f64().ok_or_else(|| mismatch(index, "a number", value))
}

/// String argument at `index`
pub fn str_arg(args: &[RpcValue], index: usize) -> anyhow::Result<&str> {
    let value = arg(args, index)?;
    value.as_str().ok_or_else(|| mismatch(index, "a string", value))
}

/// Boolean argument at `index`
pub fn bool_arg(args: &[RpcValue], index: usize) -> anyhow::Result<bool> {
    let value = arg(args, index)?;
    value.as_bool().ok_or_else(|| mismatch(index, "a boolean", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::net::Ipv4Addr;

    fn context() -> CallContext<'static> {
        CallContext {
            username: "u1",
            client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    fn registry() -> MethodRegistry {
        MethodRegistry::new()
            .with("add", |_, args| Ok((int_arg(args, 0)? + int_arg(args, 1)?).to_string()))
            .with("whoami", |ctx, _| Ok(ctx.username.to_string()))
            .with("read_config", |_, _| {
                let missing: Result<String, std::io::Error> =
                    Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"));
                missing.context("loading server.toml")
            })
    }

    #[test]
    fn test_invoke() {
        let registry = registry();
        let args = [RpcValue::from(33), RpcValue::from(44)];
        assert_eq!(registry.invoke(&context(), "add", &args).unwrap(), "77");
        assert_eq!(registry.invoke(&context(), "whoami", &[]).unwrap(), "u1");
        assert_eq!(registry.names(), vec!["add", "read_config", "whoami"]);
    }

    #[test]
    fn test_unknown_method() {
        let failure = registry().invoke(&context(), "nope", &[]).unwrap_err();
        assert_eq!(failure.kind, RemoteErrorKind::MethodNotFound);
        assert_eq!(failure.message, "nope");
    }

    #[test]
    fn test_argument_errors_are_typed() {
        let failure = registry()
            .invoke(&context(), "add", &[RpcValue::from("33")])
            .unwrap_err();
        assert_eq!(failure.kind, RemoteErrorKind::InvalidArgument);
        assert!(failure.message.contains("argument 0"));
    }

    #[test]
    fn test_handler_error_chain_becomes_trace() {
        let failure = registry().invoke(&context(), "read_config", &[]).unwrap_err();
        assert_eq!(failure.kind, RemoteErrorKind::Application);
        assert_eq!(failure.message, "loading server.toml");
        assert!(failure.remote_trace.unwrap().contains("no such file"));
    }
}
