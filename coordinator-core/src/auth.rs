//! Multi-identity auth primitives — §6.1, §6.4, §9.
//!
//! Four distinct identity kinds, each with its own verification rule:
//! client WS tokens (SHA-256 hash stored, never the plaintext), service
//! HMAC tokens (`<ms-ts>.<hex-sig>`, ±5min window), sandbox bearer tokens
//! (constant-time compare against the persisted `Sandbox.auth_token`), and
//! RSA-SHA-256-signed JWTs for VCS installation-token exchange.
//!
//! Structurally grounded on the teacher's `session_auth.rs`: a TTL
//! constant, a bearer-extraction helper, and a symmetric key loaded once
//! from an env-var secret. The EIP-191/PASETO machinery itself doesn't
//! carry over — this crate's identity model is unrelated to wallet auth.

use crate::error::{CoordinatorError, Result};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode as jwt_encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Service-to-service HMAC tokens are accepted within this window either side of now.
pub const SERVICE_TOKEN_SKEW_SECS: i64 = 300;

/// Generate a fresh high-entropy client WS auth token (opaque to the client the hash belongs to).
pub fn generate_ws_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a fresh sandbox bearer token (≥128 bits entropy, per §3).
pub fn generate_sandbox_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time check that `candidate`'s SHA-256 matches `expected_hash`.
pub fn ws_token_matches(candidate: &str, expected_hash: &str) -> bool {
    let computed = sha256_hex(candidate);
    computed.as_bytes().ct_eq(expected_hash.as_bytes()).into()
}

/// Constant-time check of a sandbox bearer token against the persisted value.
pub fn sandbox_token_matches(candidate: &str, expected: &str) -> bool {
    candidate.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub fn extract_bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ").map(str::trim)
}

// ---------------------------------------------------------------------------
// Service-to-service HMAC tokens: `<ms-ts>.<hex-sig>`
// ---------------------------------------------------------------------------

/// Mint a time-bounded service token: `Authorization: Bearer <ms-ts>.<hex-sig>`.
pub fn mint_service_token(secret: &str, now_ms: i64) -> Result<String> {
    let sig = hmac_sign(secret, &now_ms.to_string())?;
    Ok(format!("{now_ms}.{sig}"))
}

/// Verify a service token against `secret`, accepting timestamps within
/// `SERVICE_TOKEN_SKEW_SECS` seconds either side of `now_ms`.
pub fn verify_service_token(token: &str, secret: &str, now_ms: i64) -> Result<()> {
    let (ts_str, sig) = token
        .split_once('.')
        .ok_or_else(|| CoordinatorError::Unauthenticated("malformed service token".into()))?;
    let ts: i64 = ts_str
        .parse()
        .map_err(|_| CoordinatorError::Unauthenticated("malformed service token timestamp".into()))?;

    let skew_ms = SERVICE_TOKEN_SKEW_SECS * 1000;
    if (now_ms - ts).abs() > skew_ms {
        return Err(CoordinatorError::Unauthenticated(
            "service token outside acceptable time window".into(),
        ));
    }

    let expected = hmac_sign(secret, ts_str)?;
    let matches: bool = expected.as_bytes().ct_eq(sig.as_bytes()).into();
    if !matches {
        return Err(CoordinatorError::Unauthenticated("invalid service token signature".into()));
    }
    Ok(())
}

fn hmac_sign(secret: &str, message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CoordinatorError::Auth(format!("invalid hmac key: {e}")))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// ---------------------------------------------------------------------------
// RSA-SHA-256-signed JWT for VCS app installation tokens — §6.4
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Mint the RS256 app JWT exchanged for a short-lived installation access token.
/// Claims per §6.4: `iat = now-60`, `exp = now+600`, `iss = app_id`.
pub fn mint_app_jwt(app_id: &str, private_key_pem: &str, now_secs: i64) -> Result<String> {
    let claims = AppJwtClaims {
        iat: now_secs - 60,
        exp: now_secs + 600,
        iss: app_id.to_string(),
    };
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| CoordinatorError::Auth(format!("invalid RSA private key: {e}")))?;
    let header = Header::new(Algorithm::RS256);
    jwt_encode(&header, &claims, &key).map_err(|e| CoordinatorError::Auth(format!("jwt signing failed: {e}")))
}

// ---------------------------------------------------------------------------
// At-rest encryption of VCS access tokens (ChaCha20-Poly1305)
// ---------------------------------------------------------------------------

/// Derive a 32-byte ChaCha20-Poly1305 key from the root secret via HKDF-SHA256.
fn derive_key(root_secret: &str) -> Result<[u8; 32]> {
    let hk = hkdf::Hkdf::<Sha256>::new(None, root_secret.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(b"coordinator-access-token-v1", &mut okm)
        .map_err(|e| CoordinatorError::Auth(format!("hkdf expand failed: {e}")))?;
    Ok(okm)
}

/// Encrypt a VCS access token for at-rest storage. Output is `nonce || ciphertext`.
pub fn encrypt_access_token(root_secret: &str, plaintext: &str) -> Result<Vec<u8>> {
    let key_bytes = derive_key(root_secret)?;
    let cipher = ChaCha20Poly1305::new((&key_bytes).into());
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| CoordinatorError::Auth(format!("encryption failed: {e}")))?;
    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a VCS access token encrypted by [`encrypt_access_token`].
/// `decrypt(encrypt(t)) == t` is a testable property (§8).
pub fn decrypt_access_token(root_secret: &str, blob: &[u8]) -> Result<String> {
    if blob.len() < 12 {
        return Err(CoordinatorError::Auth("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(12);
    let key_bytes = derive_key(root_secret)?;
    let cipher = ChaCha20Poly1305::new((&key_bytes).into());
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CoordinatorError::Auth(format!("decryption failed: {e}")))?;
    String::from_utf8(plaintext).map_err(|e| CoordinatorError::Auth(format!("invalid utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_token_hash_round_trips() {
        let token = generate_ws_token();
        let hash = sha256_hex(&token);
        assert!(ws_token_matches(&token, &hash));
        assert!(!ws_token_matches("wrong-token", &hash));
    }

    #[test]
    fn service_token_accepted_within_skew_rejected_outside() {
        let secret = "shared-secret";
        let now = 1_700_000_000_000i64;
        let token = mint_service_token(secret, now).unwrap();

        assert!(verify_service_token(&token, secret, now).is_ok());
        assert!(verify_service_token(&token, secret, now + 4 * 60 * 1000).is_ok());
        assert!(verify_service_token(&token, secret, now + 6 * 60 * 1000).is_err());
        assert!(verify_service_token(&token, "wrong-secret", now).is_err());
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let root = "root-secret-material";
        let plaintext = "gho_superdupersecrettoken";
        let blob = encrypt_access_token(root, plaintext).unwrap();
        assert_ne!(blob, plaintext.as_bytes());
        let recovered = decrypt_access_token(root, &blob).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn decrypt_fails_with_wrong_key() {
        let blob = encrypt_access_token("key-a", "secret").unwrap();
        assert!(decrypt_access_token("key-b", &blob).is_err());
    }

    #[test]
    fn sandbox_token_constant_time_match() {
        assert!(sandbox_token_matches("abc123", "abc123"));
        assert!(!sandbox_token_matches("abc123", "abc124"));
    }

    #[test]
    fn extract_bearer_strips_prefix() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("abc"), None);
    }
}
