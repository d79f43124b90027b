//! Remote call marshalling
//!
//! An invocation travels as three parameters: `methodName`, `paramsTypes`
//! and `paramsValues`. The two lists are JSON arrays of strings. In the
//! legacy wire format both lists and the returned payload are base64
//! encoded as well.

use crate::codec::{escape_html, unescape_html, DecodedParams, RequestParameter};
use crate::error::{FilegateError, Result};
use crate::protocol::{param, Action};
use crate::rpc::{ArgKind, RpcValue};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Wire encoding of remote calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingMode {
    /// Lists as JSON, result HTML-escaped
    #[default]
    HtmlEncoded,
    /// Lists and result base64 encoded; kept for older peers
    LegacyBase64,
}

impl EncodingMode {
    /// Action code carrying calls in this mode
    pub fn action(&self) -> Action {
        match self {
            EncodingMode::HtmlEncoded => Action::CallHtmlEncoded,
            EncodingMode::LegacyBase64 => Action::Call,
        }
    }

    /// Mode implied by an action code
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::CallHtmlEncoded => Some(EncodingMode::HtmlEncoded),
            Action::Call => Some(EncodingMode::LegacyBase64),
            _ => None,
        }
    }

    /// Serialize a list of strings
    pub fn encode_list(&self, list: &[String]) -> Result<String> {
        let json = serde_json::to_string(list)?;
        Ok(match self {
            EncodingMode::HtmlEncoded => json,
            EncodingMode::LegacyBase64 => BASE64.encode(json),
        })
    }

    /// Deserialize a list of strings
    pub fn decode_list(&self, raw: &str) -> Result<Vec<String>> {
        let json = match self {
            EncodingMode::HtmlEncoded => raw.to_string(),
            EncodingMode::LegacyBase64 => decode_base64(raw)?,
        };
        serde_json::from_str(&json)
            .map_err(|e| FilegateError::invalid(format!("malformed argument list: {}", e)))
    }

    /// Encode a call result for the envelope payload
    pub fn encode_result(&self, result: &str) -> String {
        match self {
            EncodingMode::HtmlEncoded => escape_html(result).into_owned(),
            EncodingMode::LegacyBase64 => BASE64.encode(result),
        }
    }

    /// Decode a call result from the envelope payload
    pub fn decode_result(&self, payload: &str) -> Result<String> {
        match self {
            EncodingMode::HtmlEncoded => Ok(unescape_html(payload).into_owned()),
            EncodingMode::LegacyBase64 => decode_base64(payload)
                .map_err(|e| FilegateError::protocol(format!("undecodable call result: {}", e))),
        }
    }
}

fn decode_base64(raw: &str) -> Result<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact)
        .map_err(|e| FilegateError::invalid(format!("invalid base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|_| FilegateError::invalid("base64 content is not UTF-8"))
}

/// A remote method invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcInvocation {
    method: String,
    kinds: Vec<ArgKind>,
    values: Vec<String>,
}

impl RpcInvocation {
    /// Build an invocation from typed arguments
    pub fn new(method: &str, args: &[RpcValue]) -> Result<Self> {
        let method = method.trim();
        if method.is_empty() {
            return Err(FilegateError::invalid("method name is empty"));
        }

        Ok(Self {
            method: method.to_string(),
            kinds: args.iter().map(RpcValue::kind).collect(),
            values: args.iter().map(RpcValue::to_wire).collect(),
        })
    }

    /// Method name
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Argument kinds, in order
    pub fn kinds(&self) -> &[ArgKind] {
        &self.kinds
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether the call has no argument
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Request parameters carrying this invocation
    pub fn to_params(&self, mode: EncodingMode) -> Result<Vec<RequestParameter>> {
        let tags: Vec<String> = self.kinds.iter().map(|k| k.tag().to_string()).collect();
        Ok(vec![
            RequestParameter::new(param::METHOD_NAME, self.method.clone()),
            RequestParameter::new(param::PARAMS_TYPES, mode.encode_list(&tags)?),
            RequestParameter::new(param::PARAMS_VALUES, mode.encode_list(&self.values)?),
        ])
    }

    /// Rebuild an invocation from decoded request parameters
    pub fn from_params(params: &DecodedParams, mode: EncodingMode) -> Result<Self> {
        let method = params.require(param::METHOD_NAME)?.trim().to_string();
        if method.is_empty() {
            return Err(FilegateError::invalid("method name is empty"));
        }

        let tags = mode.decode_list(params.get(param::PARAMS_TYPES).unwrap_or("[]"))?;
        let values = mode.decode_list(params.get(param::PARAMS_VALUES).unwrap_or("[]"))?;
        if tags.len() != values.len() {
            return Err(FilegateError::invalid(format!(
                "{} argument kinds for {} argument values",
                tags.len(),
                values.len()
            )));
        }

        let kinds = tags
            .iter()
            .map(|tag| {
                ArgKind::from_tag(tag)
                    .ok_or_else(|| FilegateError::invalid(format!("unsupported argument kind '{}'", tag)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            method,
            kinds,
            values,
        })
    }

    /// Typed arguments
    pub fn arguments(&self) -> Result<Vec<RpcValue>> {
        self.kinds
            .iter()
            .zip(&self.values)
            .map(|(kind, value)| RpcValue::from_wire(*kind, value))
            .collect()
    }
}
