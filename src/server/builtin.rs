//! Methods registered by `filegate serve`

use crate::protocol::{RemoteErrorKind, RemoteFailure};
use crate::rpc::{int_arg, str_arg, MethodRegistry};
use chrono::{SecondsFormat, Utc};

/// `echo(string)`, `add(long, long)`, `whoami()` and `server_time()`
pub fn builtin_methods() -> MethodRegistry {
    MethodRegistry::new()
        .with("echo", |_, args| Ok(str_arg(args, 0)?.to_string()))
        .with("add", |_, args| {
            let sum = int_arg(args, 0)?.checked_add(int_arg(args, 1)?).ok_or_else(|| {
                RemoteFailure::new(RemoteErrorKind::InvalidArgument, "integer overflow")
            })?;
            Ok(sum.to_string())
        })
        .with("whoami", |ctx, _| Ok(ctx.username.to_string()))
        .with("server_time", |_, _| {
            Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{CallContext, RpcValue};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_builtins() {
        let methods = builtin_methods();
        let ctx = CallContext {
            username: "u1",
            client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        };

        assert_eq!(methods.invoke(&ctx, "echo", &[RpcValue::from("a<b")]).unwrap(), "a<b");
        assert_eq!(
            methods.invoke(&ctx, "add", &[RpcValue::from(33), RpcValue::from(44)]).unwrap(),
            "77"
        );
        assert_eq!(methods.invoke(&ctx, "whoami", &[]).unwrap(), "u1");
        assert!(methods.invoke(&ctx, "server_time", &[]).unwrap().ends_with('Z'));

        let overflow = methods
            .invoke(&ctx, "add", &[RpcValue::from(i64::MAX), RpcValue::from(1i64)])
            .unwrap_err();
        assert_eq!(overflow.kind, RemoteErrorKind::InvalidArgument);
    }
}
