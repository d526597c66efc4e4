use sha2::{Digest, Sha256};

/// Digest a bearer token for use as a store key.
///
/// Tokens are never persisted verbatim; whoever can read the store must not
/// thereby hold every live credential. Tokens carry 128+ bits of entropy, so
/// the digest is unsalted.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
