//! Authentication token derivation
//!
//! A token is never stored server-side. It is a pure function of the
//! username and the server secret, recomputed on every request.

use super::TOKEN_LENGTH;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Derive the token for `username` under `secret`
pub fn derive_token(username: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update([0u8]);
    hasher.update(secret.as_bytes());
    let mut token = hex::encode(hasher.finalize());
    token.truncate(TOKEN_LENGTH);
    token
}

/// Check a client-supplied token against a fresh derivation
pub fn verify_token(username: &str, secret: &str, supplied: &str) -> bool {
    let expected = derive_token(username, secret);
    bool::from(expected.as_bytes().ct_eq(supplied.as_bytes()))
}

/// Clamp a token received in a login reply to [`TOKEN_LENGTH`]
pub fn truncate_token(raw: &str) -> String {
    raw.trim().chars().take(TOKEN_LENGTH).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_token_shape() {
        let token = derive_token("u1", "server-secret");
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_token_depends_on_both_inputs() {
        let base = derive_token("u1", "secret");
        assert_ne!(base, derive_token("u2", "secret"));
        assert_ne!(base, derive_token("u1", "other"));
        // The separator keeps the split point significant
        assert_ne!(derive_token("ab", "c"), derive_token("a", "bc"));
    }

    #[test]
    fn test_verify_rejects_tampered_tokens() {
        let token = derive_token("u1", "secret");
        assert!(verify_token("u1", "secret", &token));
        assert!(!verify_token("u1", "secret", "deadbeef"));
        assert!(!verify_token("u2", "secret", &token));

        let mut flipped = token.clone().into_bytes();
        flipped[0] = if flipped[0] == b'a' { b'b' } else { b'a' };
        assert!(!verify_token("u1", "secret", &String::from_utf8(flipped).unwrap()));
    }

    #[test]
    fn test_truncate_token() {
        assert_eq!(truncate_token(" 0123456789abcdef0123456789 \n"), "0123456789abcdef0123");
        assert_eq!(truncate_token("abc"), "abc");
    }

    proptest! {
        #[test]
        fn prop_derivation_is_deterministic(user in ".{0,40}", secret in ".{0,40}") {
            prop_assert_eq!(derive_token(&user, &secret), derive_token(&user, &secret));
            prop_assert!(verify_token(&user, &secret, &derive_token(&user, &secret)));
        }
    }
}
