//! Wire protocol shared by client and server
//!
//! Every exchange is a single HTTP request carrying form parameters (or a
//! multipart body for uploads) and a textual reply wrapped in a response
//! envelope. Names and values defined here must match bit-for-bit on both
//! sides.
//!
//! ## Actions
//!
//! | Action | Token | Payload on success |
//! |--------|-------|--------------------|
//! | `before_login` | no | `true` / `false` (secure transport required) |
//! | `login` | no | `OK <token>` or `INVALID_LOGIN_OR_PASSWORD` |
//! | `get_file_length` | yes | decimal length, `0` when missing |
//! | `get_remote_version` | yes | `filegate/<version>` |
//! | `call_html_encoded` | yes | HTML-escaped result |
//! | `call` | yes | base64 result (legacy) |
//! | `upload` | yes | `OK` |
//! | `download` | yes | raw bytes |
//! | `exists` / `delete` | yes | `true` / `false` |
//! | `list_files` | yes | JSON array of names |

mod envelope;
mod token;

pub use envelope::*;
pub use token::*;

use std::fmt;
use std::str::FromStr;

/// Request parameter names
pub mod param {
    /// Action code
    pub const ACTION: &str = "action";
    /// Login name
    pub const USERNAME: &str = "username";
    /// Login password (login action only)
    pub const PASSWORD: &str = "password";
    /// Authentication token
    pub const TOKEN: &str = "token";
    /// Remote method name
    pub const METHOD_NAME: &str = "methodName";
    /// Serialized argument kind tags
    pub const PARAMS_TYPES: &str = "paramsTypes";
    /// Serialized argument values
    pub const PARAMS_VALUES: &str = "paramsValues";
    /// Remote file path
    pub const FILENAME: &str = "filename";
    /// Negotiated chunk length, 0 when chunking is disabled
    pub const CHUNK_LENGTH: &str = "chunkLength";
    /// Zero-based chunk index
    pub const CHUNK_INDEX: &str = "chunkIndex";
    /// Total number of chunks in an upload
    pub const CHUNK_COUNT: &str = "chunkCount";
    /// Canary carrying [`super::TEST_CRYPTO_VALUE`]
    pub const TEST_CRYPTO: &str = "testCrypto";
    /// Protocol version marker
    pub const VERSION: &str = "version";
    /// Pass-through parameter exempt from escaping and encryption
    pub const STATEMENT_HOLDER: &str = "statementHolder";
    /// Multipart binary part
    pub const FILE: &str = "file";
}

/// Known plaintext of the canary parameter
pub const TEST_CRYPTO_VALUE: &str = "TestCrypto";

/// Value sent in the `version` parameter
pub const PROTOCOL_VERSION: &str = "2";

/// Prefix of encrypted parameter values
pub const ENCRYPTED_MARKER: &str = "*!fg!*";

/// Envelope status token for success
pub const SEND_OK: &str = "SEND_OK";

/// Envelope status token for failure
pub const SEND_FAILED: &str = "SEND_FAILED";

/// Login success marker, followed by a space and the token
pub const OK: &str = "OK";

/// Uniform rejection marker for bad credentials and bad tokens
pub const INVALID_LOGIN_OR_PASSWORD: &str = "INVALID_LOGIN_OR_PASSWORD";

/// Length of an authentication token in hex characters
pub const TOKEN_LENGTH: usize = 20;

/// Default chunk length: 10 MiB
pub const DEFAULT_CHUNK_LENGTH: u64 = 10 * 1024 * 1024;

/// Action codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Ask whether the server requires https before sending credentials
    BeforeLogin,
    /// Exchange credentials for a token
    Login,
    /// Length of a remote file
    GetFileLength,
    /// Server runtime version
    GetRemoteVersion,
    /// Remote call with HTML-escaped lists and result
    CallHtmlEncoded,
    /// Remote call with base64 lists and result (legacy wire format)
    Call,
    /// Multipart chunk upload
    Upload,
    /// Chunk download
    Download,
    /// Remote file existence
    Exists,
    /// Remote file deletion
    Delete,
    /// Remote directory listing
    ListFiles,
}

impl Action {
    /// All action codes
    pub const ALL: [Action; 11] = [
        Action::BeforeLogin,
        Action::Login,
        Action::GetFileLength,
        Action::GetRemoteVersion,
        Action::CallHtmlEncoded,
        Action::Call,
        Action::Upload,
        Action::Download,
        Action::Exists,
        Action::Delete,
        Action::ListFiles,
    ];

    /// Wire code
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::BeforeLogin => "before_login",
            Action::Login => "login",
            Action::GetFileLength => "get_file_length",
            Action::GetRemoteVersion => "get_remote_version",
            Action::CallHtmlEncoded => "call_html_encoded",
            Action::Call => "call",
            Action::Upload => "upload",
            Action::Download => "download",
            Action::Exists => "exists",
            Action::Delete => "delete",
            Action::ListFiles => "list_files",
        }
    }

    /// Whether the request must carry a valid token
    pub fn requires_token(&self) -> bool {
        !matches!(self, Action::BeforeLogin | Action::Login)
    }

    /// Whether the action is a remote method call
    pub fn is_call(&self) -> bool {
        matches!(self, Action::Call | Action::CallHtmlEncoded)
    }

    /// Whether replaying the request has no side effect
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            Action::Call | Action::CallHtmlEncoded | Action::Upload | Action::Delete
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("Unknown action: {}", s))
    }
}
