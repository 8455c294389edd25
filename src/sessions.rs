use crate::auth::{TokenKind, TokenSigner};
use crate::bus::{CacheBus, SESSION_CACHE_MAX_TTL_SECS};
use crate::db::{generate_refresh_secret, new_id, now_ts, Db};
use crate::error::ApiError;
use crate::models::{Caller, DeviceMeta, Session, TokenResponse, User};

/// Tracks credentialed logins across devices. The store is authoritative;
/// the cache accelerates gateway auth and is repopulated on every store hit.
#[derive(Clone)]
pub struct SessionRegistry {
    db: Db,
    bus: CacheBus,
    signer: TokenSigner,
    refresh_ttl_secs: i64,
}

impl SessionRegistry {
    pub fn new(db: Db, bus: CacheBus, signer: TokenSigner, refresh_ttl_secs: i64) -> Self {
        SessionRegistry { db, bus, signer, refresh_ttl_secs }
    }

    /// Creates a session, persists it, primes all three cache key patterns
    /// and issues the credential pair.
    pub async fn create(&self, user: &User, device: DeviceMeta) -> Result<TokenResponse, ApiError> {
        let now = now_ts();
        let expires_at = (chrono::Utc::now()
            + chrono::Duration::seconds(self.refresh_ttl_secs))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let session = Session {
            id: new_id(),
            user_id: user.id.clone(),
            refresh_secret: generate_refresh_secret(),
            device_id: device.device_id,
            device_kind: device.device_kind,
            device_label: device.device_label,
            socket_id: None,
            ip_address: device.ip_address,
            user_agent: device.user_agent,
            active: true,
            last_activity_at: now.clone(),
            created_at: now,
            expires_at,
        };
        self.db.create_session(&session)?;
        self.recache(&session).await;

        Ok(TokenResponse {
            access_credential: self.signer.issue_access(&session),
            refresh_credential: self.signer.issue_refresh(&session),
            session_id: session.id,
            user: user.clone(),
        })
    }

    /// Resolves an access credential to its caller. Cache first, store
    /// fallback; rejects inactive and expired sessions.
    pub async fn resolve_access(&self, token: &str) -> Result<(Caller, Session), ApiError> {
        let claims = self.signer.verify(TokenKind::Access, token)?;
        let session = self.load_session(&claims.sid).await?;
        if session.user_id != claims.uid {
            return Err(ApiError::Unauthenticated("invalid credential".to_string()));
        }
        Ok((
            Caller {
                user_id: session.user_id.clone(),
                session_id: session.id.clone(),
            },
            session,
        ))
    }

    /// Resolves a refresh credential, verifying the signature and the
    /// session's rotation secret.
    pub async fn resolve_by_refresh(&self, token: &str) -> Result<Session, ApiError> {
        let claims = self.signer.verify(TokenKind::Refresh, token)?;
        let secret = claims
            .sec
            .ok_or_else(|| ApiError::Unauthenticated("invalid credential".to_string()))?;

        let cached = self.bus.session_by_refresh(&secret).await.unwrap_or(None);
        let session = match cached {
            Some(session) => session,
            None => {
                let session = self
                    .db
                    .find_session_by_refresh(&secret)?
                    .ok_or_else(|| ApiError::Unauthenticated("invalid credential".to_string()))?;
                self.recache(&session).await;
                session
            }
        };
        validate_session(&session)?;
        if session.id != claims.sid || session.user_id != claims.uid {
            return Err(ApiError::Unauthenticated("invalid credential".to_string()));
        }
        Ok(session)
    }

    /// New access credential for an already-resolved session; slides the
    /// session expiry forward.
    pub async fn reissue_access(&self, session: &Session) -> Result<String, ApiError> {
        let new_expiry = (chrono::Utc::now()
            + chrono::Duration::seconds(self.refresh_ttl_secs))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        self.extend(&session.id, &new_expiry).await?;
        Ok(self.signer.issue_access(session))
    }

    /// Records the gateway socket on the session, in store and cache.
    pub async fn attach_socket(
        &self,
        session_id: &str,
        socket_id: Option<&str>,
    ) -> Result<(), ApiError> {
        self.db.attach_socket(session_id, socket_id)?;
        if let Some(session) = self.db.find_session_by_id(session_id)? {
            self.recache(&session).await;
        }
        Ok(())
    }

    /// Active sessions for the user: the cached id set plus one batched blob
    /// fetch, falling back to the store when the cache is cold.
    pub async fn list_active(&self, user_id: &str) -> Result<Vec<Session>, ApiError> {
        let ids = self.bus.session_ids_for_user(user_id).await.unwrap_or_default();
        if !ids.is_empty() {
            let sessions: Vec<Session> = self
                .bus
                .sessions_by_ids(&ids)
                .await
                .unwrap_or_default()
                .into_iter()
                .filter(|s| validate_session(s).is_ok())
                .collect();
            if !sessions.is_empty() {
                return Ok(sessions);
            }
        }
        self.db.list_sessions_for_user(user_id)
    }

    pub async fn invalidate(&self, session_id: &str) -> Result<(), ApiError> {
        if let Some(session) = self.db.find_session_by_id(session_id)? {
            self.db.deactivate_session(session_id)?;
            if let Err(e) = self.bus.evict_session(&session).await {
                eprintln!("⚠️ session cache evict failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn invalidate_all(&self, user_id: &str) -> Result<(), ApiError> {
        let sessions = self.db.list_sessions_for_user(user_id)?;
        self.db.deactivate_all_sessions(user_id)?;
        for session in sessions {
            if let Err(e) = self.bus.evict_session(&session).await {
                eprintln!("⚠️ session cache evict failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn extend(&self, session_id: &str, new_expiry: &str) -> Result<(), ApiError> {
        self.db.extend_session(session_id, new_expiry)?;
        if let Some(session) = self.db.find_session_by_id(session_id)? {
            self.recache(&session).await;
        }
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Session, ApiError> {
        let cached = self.bus.session_by_id(session_id).await.unwrap_or(None);
        let session = match cached {
            Some(session) => session,
            None => {
                let session = self
                    .db
                    .find_session_by_id(session_id)?
                    .ok_or_else(|| ApiError::Unauthenticated("invalid credential".to_string()))?;
                self.recache(&session).await;
                session
            }
        };
        validate_session(&session)?;
        Ok(session)
    }

    /// Cache TTL is the session's remaining life, capped at an hour.
    /// Cache failures are logged, never fatal; the store is authoritative.
    async fn recache(&self, session: &Session) {
        let remaining = chrono::DateTime::parse_from_rfc3339(&session.expires_at)
            .map(|exp| exp.timestamp() - chrono::Utc::now().timestamp())
            .unwrap_or(0);
        let ttl = remaining.min(SESSION_CACHE_MAX_TTL_SECS);
        if session.active && ttl > 0 {
            if let Err(e) = self.bus.cache_session(session, ttl).await {
                eprintln!("⚠️ session cache write failed: {e}");
            }
        }
    }
}

fn validate_session(session: &Session) -> Result<(), ApiError> {
    if !session.active {
        return Err(ApiError::Unauthenticated("session inactive".to_string()));
    }
    let expired = chrono::DateTime::parse_from_rfc3339(&session.expires_at)
        .map(|exp| exp.timestamp() <= chrono::Utc::now().timestamp())
        .unwrap_or(true);
    if expired {
        return Err(ApiError::Unauthenticated("session expired".to_string()));
    }
    Ok(())
}
