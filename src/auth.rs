//! Auth subsystem.
//!
//! Password login against a PBKDF2-SHA256 hash, HMAC-signed session tokens,
//! and long-lived API keys for data-plane clients. Sessions are
//! self-verifying (`base64url(claims) "." base64url(hmac)`), so no server
//! record is needed. API keys are stored hashed; only the 8-character prefix
//! is kept in plaintext for display.

use crate::AppState;
use crate::error::OrchestratorError;
use crate::types::now_ms;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const PBKDF2_ITERATIONS: u32 = 100_000;

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

/// Hash a password into the `pbkdf2_sha256:{salt_b64}:{hash_b64}:{iterations}`
/// encoding used by `AUTH_PASSWORD_HASH`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut hash = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut hash);
    format!(
        "pbkdf2_sha256:{}:{}:{}",
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(hash),
        PBKDF2_ITERATIONS
    )
}

/// Constant-time verification of a password against its encoded hash.
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let mut parts = encoded.splitn(4, ':');
    let (Some("pbkdf2_sha256"), Some(salt_b64), Some(hash_b64), Some(iterations)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    let Ok(salt) = URL_SAFE_NO_PAD.decode(salt_b64) else {
        return false;
    };
    let Ok(expected) = URL_SAFE_NO_PAD.decode(hash_b64) else {
        return false;
    };
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    if iterations == 0 || expected.is_empty() {
        return false;
    }

    let mut actual = vec![0u8; expected.len()];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut actual);
    actual.ct_eq(&expected).into()
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    /// Expiry, epoch milliseconds.
    exp: i64,
}

/// Issue a signed session token. Returns `(token, expires_at)`.
pub fn issue_session(username: &str, secret: &str, timeout_hours: u64) -> (String, i64) {
    let expires_at = now_ms() + (timeout_hours as i64) * 3_600_000;
    let claims = SessionClaims {
        sub: username.to_string(),
        exp: expires_at,
    };
    let payload =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("claims serialize"));

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    (format!("{}.{}", payload, tag), expires_at)
}

/// Verify a session token's signature and expiry. Returns the username.
pub fn verify_session(token: &str, secret: &str) -> Result<String, OrchestratorError> {
    let (payload, tag_b64) = token.split_once('.').ok_or(OrchestratorError::Auth)?;
    let tag = URL_SAFE_NO_PAD
        .decode(tag_b64)
        .map_err(|_| OrchestratorError::Auth)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    mac.verify_slice(&tag).map_err(|_| OrchestratorError::Auth)?;

    let claims: SessionClaims = URL_SAFE_NO_PAD
        .decode(payload)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or(OrchestratorError::Auth)?;

    if claims.exp <= now_ms() {
        return Err(OrchestratorError::Auth);
    }
    Ok(claims.sub)
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

/// A freshly minted API key. The full key is presented once and never stored.
pub struct MintedKey {
    pub full_key: String,
    pub prefix: String,
    pub hash: String,
}

pub fn mint_key() -> MintedKey {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let full_key = format!("sk_{}", URL_SAFE_NO_PAD.encode(bytes));
    MintedKey {
        prefix: full_key[..8].to_string(),
        hash: hash_key(&full_key),
        full_key,
    }
}

/// Storage hash of a full API key.
pub fn hash_key(full_key: &str) -> String {
    format!("{:x}", Sha256::digest(full_key.as_bytes()))
}

// ---------------------------------------------------------------------------
// Request gates
// ---------------------------------------------------------------------------

/// Authenticated session username, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct Username(pub String);

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Gate for administrative endpoints: requires a valid session token in
/// `Authorization: Bearer`.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, OrchestratorError> {
    let username = {
        let token = bearer_token(request.headers()).ok_or(OrchestratorError::Auth)?;
        verify_session(token, &state.settings.jwt_secret)?
    };
    request.extensions_mut().insert(Username(username));
    Ok(next.run(request).await)
}

/// Gate for data-plane endpoints: accepts an API key as `Authorization:
/// Bearer` or `X-API-Key`. Bumps `last_used_at` off the request path.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, OrchestratorError> {
    let hash = {
        let headers = request.headers();
        let key = bearer_token(headers)
            .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
            .ok_or(OrchestratorError::Auth)?;
        hash_key(key)
    };

    if state.store.get_api_key(&hash).await?.is_none() {
        return Err(OrchestratorError::Auth);
    }

    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.touch_api_key(&hash, now_ms()).await {
            tracing::debug!(error = %e, "Failed to update key last_used_at");
        }
    });

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_round_trip() {
        let encoded = hash_password("MindAdmin123");
        assert!(encoded.starts_with("pbkdf2_sha256:"));
        assert!(verify_password("MindAdmin123", &encoded));
        assert!(!verify_password("wrong", &encoded));
    }

    #[test]
    fn test_password_rejects_malformed_hash() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "plaintext"));
        assert!(!verify_password("x", "pbkdf2_sha256:!!:!!:1000"));
        assert!(!verify_password("x", "pbkdf2_sha256:c2FsdA:aGFzaA:0"));
    }

    #[test]
    fn test_session_round_trip() {
        let (token, expires_at) = issue_session("admin", "secret", 24);
        assert!(expires_at > now_ms());
        assert_eq!(verify_session(&token, "secret").unwrap(), "admin");
    }

    #[test]
    fn test_session_rejects_tampering() {
        let (token, _) = issue_session("admin", "secret", 24);

        assert!(verify_session(&token, "other-secret").is_err());
        assert!(verify_session("garbage", "secret").is_err());

        // Forge the payload while keeping the original tag.
        let (_, tag) = token.split_once('.').unwrap();
        let forged_payload =
            URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"root","exp":{}}}"#, i64::MAX));
        let forged = format!("{}.{}", forged_payload, tag);
        assert!(verify_session(&forged, "secret").is_err());
    }

    #[test]
    fn test_session_expires() {
        let (token, _) = issue_session("admin", "secret", 0);
        assert!(verify_session(&token, "secret").is_err());
    }

    #[test]
    fn test_mint_key_shape() {
        let minted = mint_key();
        assert!(minted.full_key.starts_with("sk_"));
        assert!(minted.full_key.len() > 40);
        assert_eq!(minted.prefix.len(), 8);
        assert_eq!(minted.prefix, &minted.full_key[..8]);
        assert_eq!(minted.hash.len(), 64);
        assert_eq!(minted.hash, hash_key(&minted.full_key));
    }

    #[test]
    fn test_minted_keys_are_unique() {
        assert_ne!(mint_key().full_key, mint_key().full_key);
    }
}
