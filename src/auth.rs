use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::Config;
use crate::error::ApiError;
use crate::models::Session;

type HmacSha256 = Hmac<Sha256>;

// --- Password hashing ---

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

// --- Signed credentials ---

/// Access and refresh credentials are disjoint kinds signed with distinct
/// secrets; a token of one kind never verifies as the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// Claims bound into a credential: `{sessionId, userId, kind}` plus expiry.
/// Refresh credentials additionally carry the session's rotation secret,
/// which keys the `session:byRefresh` cache pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sid: String,
    pub uid: String,
    pub kind: String,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sec: Option<String>,
}

/// Issues and verifies opaque signed tokens:
/// `base64url(claims json) . hex(hmac-sha256(claims, secret(kind)))`.
#[derive(Clone)]
pub struct TokenSigner {
    access_secret: String,
    refresh_secret: String,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl TokenSigner {
    pub fn new(config: &Config) -> Self {
        TokenSigner {
            access_secret: config.access_secret.clone(),
            refresh_secret: config.refresh_secret.clone(),
            access_ttl_secs: config.access_ttl_secs,
            refresh_ttl_secs: config.refresh_ttl_secs,
        }
    }

    fn secret(&self, kind: TokenKind) -> &[u8] {
        match kind {
            TokenKind::Access => self.access_secret.as_bytes(),
            TokenKind::Refresh => self.refresh_secret.as_bytes(),
        }
    }

    pub fn issue_access(&self, session: &Session) -> String {
        self.issue(
            TokenKind::Access,
            session,
            self.access_ttl_secs,
            None,
        )
    }

    pub fn issue_refresh(&self, session: &Session) -> String {
        self.issue(
            TokenKind::Refresh,
            session,
            self.refresh_ttl_secs,
            Some(session.refresh_secret.clone()),
        )
    }

    fn issue(&self, kind: TokenKind, session: &Session, ttl_secs: i64, sec: Option<String>) -> String {
        let claims = TokenClaims {
            sid: session.id.clone(),
            uid: session.user_id.clone(),
            kind: kind.as_str().to_string(),
            exp: chrono::Utc::now().timestamp() + ttl_secs,
            sec,
        };
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("claims serialize"));
        let signature = self.sign(kind, payload.as_bytes());
        format!("{payload}.{signature}")
    }

    fn sign(&self, kind: TokenKind, payload: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret(kind)).expect("HMAC accepts any key length");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, kind: TokenKind, token: &str) -> Result<TokenClaims, ApiError> {
        let unauthenticated = || ApiError::Unauthenticated("invalid credential".to_string());

        let (payload, signature) = token.split_once('.').ok_or_else(unauthenticated)?;
        let mut mac =
            HmacSha256::new_from_slice(self.secret(kind)).expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        let sig_bytes = hex::decode(signature).map_err(|_| unauthenticated())?;
        mac.verify_slice(&sig_bytes).map_err(|_| unauthenticated())?;

        let claims: TokenClaims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(unauthenticated)?;
        if claims.kind != kind.as_str() {
            return Err(unauthenticated());
        }
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(ApiError::Unauthenticated("credential expired".to_string()));
        }
        Ok(claims)
    }
}
