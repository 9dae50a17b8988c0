//! Bearer token verification.
//!
//! Tokens are `base64url(claims).base64url(hmac_sha256(secret, claims_b64))`
//! with claims `{"sub": "<user uuid>", "exp": <unix seconds>}`. The user ID
//! is decoded here, once, and travels as a [`UserId`] from then on.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AuthError;
use crate::types::UserId;

type HmacSha256 = Hmac<Sha256>;

/// Resolves a credential to a verified user.
pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: UserId,
    exp: i64,
}

/// HMAC-SHA256 signed bearer tokens.
#[derive(Clone)]
pub struct TokenAuthenticator {
    secret: Vec<u8>,
}

impl TokenAuthenticator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC key length is unrestricted"),
        }
    }

    /// Mint a token for `user` valid for `ttl`.
    pub fn issue(&self, user: UserId, ttl: Duration) -> String {
        let exp = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        self.issue_with_expiry(user, exp)
    }

    fn issue_with_expiry(&self, user: UserId, exp: i64) -> String {
        let claims = Claims { sub: user, exp };
        let json = match serde_json::to_vec(&claims) {
            Ok(json) => json,
            Err(_) => unreachable!("claims are a UUID and an integer"),
        };
        let body = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.mac();
        mac.update(body.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{body}.{sig}")
    }
}

impl Authenticator for TokenAuthenticator {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let (body, sig) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| AuthError::Malformed)?;

        let mut mac = self.mac();
        mac.update(body.as_bytes());
        mac.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;

        let json = URL_SAFE_NO_PAD.decode(body).map_err(|_| AuthError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| AuthError::Malformed)?;
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims.sub)
    }
}
