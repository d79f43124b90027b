//! Parameter encoding and decoding
//!
//! Client side, every value is HTML-escaped and, when an encryption password
//! is configured, encrypted and prefixed with [`ENCRYPTED_MARKER`]. The
//! `statementHolder` and `version` parameters are passed through untouched.
//!
//! Server side, decoding detects the marker per value. Values from clients
//! that send no `version` parameter are not unescaped: those clients never
//! escaped them.

use crate::crypto::ParamCipher;
use crate::error::{FilegateError, Result};
use crate::protocol::{param, ENCRYPTED_MARKER, PROTOCOL_VERSION, TEST_CRYPTO_VALUE};
use std::borrow::Cow;
use std::collections::HashMap;

/// One request parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParameter {
    /// Wire name
    pub name: String,
    /// Value, plain before encoding, wire form after
    pub value: String,
    /// Whether `value` holds ciphertext
    pub encrypted: bool,
}

impl RequestParameter {
    /// Create a plain parameter
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            encrypted: false,
        }
    }
}

/// Tuple list of encoded parameters, in order
pub type WireParams = Vec<(String, String)>;

/// Convert encoded parameters into name/value pairs
pub fn to_wire(params: Vec<RequestParameter>) -> WireParams {
    params.into_iter().map(|p| (p.name, p.value)).collect()
}

/// HTML-escape a value
pub fn escape_html(value: &str) -> Cow<'_, str> {
    html_escape::encode_quoted_attribute(value)
}

/// Reverse [`escape_html`]
pub fn unescape_html(value: &str) -> Cow<'_, str> {
    html_escape::decode_html_entities(value)
}

fn is_pass_through(name: &str) -> bool {
    name == param::STATEMENT_HOLDER || name == param::VERSION
}

/// Parameter codec configured with the optional shared encryption password
#[derive(Debug, Clone, Default)]
pub struct ParameterCodec {
    cipher: Option<ParamCipher>,
}

impl ParameterCodec {
    /// Create a codec. Encryption is enabled only for passwords longer than
    /// one character.
    pub fn new(encryption_password: Option<&str>) -> Self {
        let cipher = encryption_password
            .filter(|p| p.chars().count() > 1)
            .map(ParamCipher::from_password);
        Self { cipher }
    }

    /// Codec that never encrypts
    pub fn plain() -> Self {
        Self::default()
    }

    /// Whether values are encrypted
    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encode one value
    pub fn encode_parameter(&self, parameter: RequestParameter) -> Result<RequestParameter> {
        if is_pass_through(&parameter.name) {
            return Ok(parameter);
        }

        let escaped = escape_html(&parameter.value).into_owned();
        match &self.cipher {
            Some(cipher) => Ok(RequestParameter {
                name: parameter.name,
                value: format!("{}{}", ENCRYPTED_MARKER, cipher.encrypt(&escaped)?),
                encrypted: true,
            }),
            None => Ok(RequestParameter {
                name: parameter.name,
                value: escaped,
                encrypted: false,
            }),
        }
    }

    /// Encode a full request
    ///
    /// Adds the canary when encrypting (if the caller did not) and always
    /// appends the protocol version.
    pub fn encode(&self, params: Vec<RequestParameter>) -> Result<Vec<RequestParameter>> {
        let has_canary = params.iter().any(|p| p.name == param::TEST_CRYPTO);
        let mut encoded = params
            .into_iter()
            .filter(|p| p.name != param::VERSION)
            .map(|p| self.encode_parameter(p))
            .collect::<Result<Vec<_>>>()?;

        if self.is_encrypting() && !has_canary {
            encoded.push(
                self.encode_parameter(RequestParameter::new(param::TEST_CRYPTO, TEST_CRYPTO_VALUE))?,
            );
        }
        encoded.push(RequestParameter::new(param::VERSION, PROTOCOL_VERSION));
        Ok(encoded)
    }

    /// Decode one raw value
    pub fn decode_value(&self, name: &str, raw: &str, versioned: bool) -> Result<String> {
        if is_pass_through(name) {
            return Ok(raw.to_string());
        }

        let text = match raw.strip_prefix(ENCRYPTED_MARKER) {
            Some(ciphertext) => {
                let cipher = self.cipher.as_ref().ok_or_else(|| {
                    FilegateError::config(
                        "received encrypted parameters but no encryption password is configured",
                    )
                })?;
                cipher.decrypt(ciphertext).map_err(|_| {
                    if name == param::TEST_CRYPTO {
                        FilegateError::config(
                            "encryption passwords differ between client and server",
                        )
                    } else {
                        FilegateError::SecurityError(format!(
                            "parameter '{}' could not be decrypted",
                            name
                        ))
                    }
                })?
            }
            None => raw.to_string(),
        };

        if versioned {
            Ok(unescape_html(&text).into_owned())
        } else {
            Ok(text)
        }
    }

    /// Decode a full request and check the canary
    pub fn decode<'a, I>(&self, raw: I) -> Result<DecodedParams>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut raw: Vec<(&str, &str)> = raw.into_iter().collect();
        let versioned = raw.iter().any(|(name, _)| *name == param::VERSION);

        // Canary first, so a password mismatch is reported as such
        raw.sort_by_key(|(name, _)| *name != param::TEST_CRYPTO);

        let mut values = HashMap::with_capacity(raw.len());
        for (name, value) in raw {
            values.insert(name.to_string(), self.decode_value(name, value, versioned)?);
        }

        if let Some(canary) = values.get(param::TEST_CRYPTO) {
            if canary != TEST_CRYPTO_VALUE {
                return Err(FilegateError::config(
                    "encryption passwords differ between client and server",
                ));
            }
        }

        Ok(DecodedParams { values, versioned })
    }
}

/// Decoded request parameters
#[derive(Debug, Clone, Default)]
pub struct DecodedParams {
    values: HashMap<String, String>,
    versioned: bool,
}

impl DecodedParams {
    /// Whether the client sent a protocol version
    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    /// Get a parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Get a parameter, empty string when absent
    pub fn get_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    /// Get a required parameter
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| FilegateError::invalid(format!("missing parameter '{}'", name)))
    }

    /// Get an optional numeric parameter
    pub fn get_u64(&self, name: &str) -> Result<Option<u64>> {
        match self.get(name).map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(v) => v.parse().map(Some).map_err(|_| {
                FilegateError::invalid(format!("parameter '{}' is not a number: {}", name, v))
            }),
        }
    }
}
