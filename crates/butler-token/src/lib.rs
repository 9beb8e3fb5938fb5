//! Opaque bearer tokens for Butler Registry.
//!
//! Two token families exist, distinguished by prefix:
//! - `brce_` — run callback tokens, minted per dispatched run and accepted
//!   only on executor callback endpoints
//! - `breg_` — registry API tokens, accepted only on registry endpoints
//!
//! Only the SHA-256 hash of a token is ever persisted. The prefix boundary
//! is enforced before any hash lookup, so a callback token can never
//! authenticate against registry CRUD and vice versa. Tokens with neither
//! prefix are legacy and pass the boundary check at both surfaces.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Prefix for run callback tokens.
pub const CALLBACK_PREFIX: &str = "brce_";

/// Prefix for registry API tokens.
pub const REGISTRY_PREFIX: &str = "breg_";

/// Number of random bytes behind each minted token.
const TOKEN_BYTES: usize = 32;

/// A freshly minted token together with its storable hash.
///
/// The plaintext `token` is handed to the caller exactly once; `token_hash`
/// is the SHA-256 hex digest that goes to storage.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub token_hash: String,
}

/// Which family a presented token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Callback,
    Registry,
    /// No recognized prefix; permitted for backward compatibility.
    Legacy,
}

/// Classify a token by its prefix.
pub fn classify(token: &str) -> TokenKind {
    if token.starts_with(CALLBACK_PREFIX) {
        TokenKind::Callback
    } else if token.starts_with(REGISTRY_PREFIX) {
        TokenKind::Registry
    } else {
        TokenKind::Legacy
    }
}

/// Mint a run callback token (`brce_` + 32 CSPRNG bytes hex).
pub fn mint_callback_token() -> MintedToken {
    mint_with_prefix(CALLBACK_PREFIX)
}

/// Mint a registry API token (`breg_` + 32 CSPRNG bytes hex).
pub fn mint_registry_token() -> MintedToken {
    mint_with_prefix(REGISTRY_PREFIX)
}

fn mint_with_prefix(prefix: &str) -> MintedToken {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    let token = format!("{prefix}{}", hex::encode(bytes));
    let token_hash = hash_token(&token);
    MintedToken { token, token_hash }
}

/// SHA-256 hex digest of a token, as persisted.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Verify a presented token against a stored hash in constant time.
///
/// A malformed stored hash never verifies.
pub fn verify_token(token: &str, stored_hash: &str) -> bool {
    let Ok(stored) = hex::decode(stored_hash) else {
        return false;
    };
    let digest = Sha256::digest(token.as_bytes());
    digest.as_slice().ct_eq(&stored).into()
}

/// Extract the token from an `Authorization` header value.
///
/// The `"Bearer "` prefix is matched case-sensitively; an empty remainder
/// yields none.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?;
    if token.is_empty() { None } else { Some(token) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mint_shape() {
        let minted = mint_callback_token();
        assert!(minted.token.starts_with(CALLBACK_PREFIX));
        // Prefix plus 32 bytes of hex.
        assert_eq!(minted.token.len(), CALLBACK_PREFIX.len() + 64);
        assert_eq!(minted.token_hash.len(), 64);

        let reg = mint_registry_token();
        assert!(reg.token.starts_with(REGISTRY_PREFIX));
    }

    #[test]
    fn test_mint_is_unique() {
        assert_ne!(mint_callback_token().token, mint_callback_token().token);
    }

    #[test]
    fn test_verify_roundtrip() {
        let minted = mint_callback_token();
        assert!(verify_token(&minted.token, &minted.token_hash));
    }

    #[test]
    fn test_verify_rejects_wrong_token() {
        let minted = mint_callback_token();
        let other = mint_callback_token();
        assert!(!verify_token(&other.token, &minted.token_hash));
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        let minted = mint_callback_token();
        assert!(!verify_token(&minted.token, "not-hex"));
        assert!(!verify_token(&minted.token, ""));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("brce_abc"), TokenKind::Callback);
        assert_eq!(classify("breg_abc"), TokenKind::Registry);
        assert_eq!(classify("ghp_something"), TokenKind::Legacy);
        assert_eq!(classify(""), TokenKind::Legacy);
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer brce_x"), Some("brce_x"));
        assert_eq!(extract_bearer("bearer brce_x"), None);
        assert_eq!(extract_bearer("Bearer"), None);
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("Basic abc"), None);
    }

    proptest! {
        /// Any single-bit flip in the token breaks verification.
        #[test]
        fn prop_bit_flip_fails(byte_index in 0usize..69, bit in 0u8..8) {
            let minted = mint_callback_token();
            let mut bytes = minted.token.clone().into_bytes();
            let len = bytes.len();
            bytes[byte_index % len] ^= 1 << bit;
            let mutated = String::from_utf8_lossy(&bytes).to_string();
            prop_assert!(!verify_token(&mutated, &minted.token_hash));
        }

        /// Hashing is deterministic and hex-shaped.
        #[test]
        fn prop_hash_deterministic(token in "[ -~]{0,64}") {
            let a = hash_token(&token);
            let b = hash_token(&token);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.len(), 64);
            prop_assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
