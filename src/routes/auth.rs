use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{post, State};

use super::Authed;
use crate::auth::{hash_password, verify_password};
use crate::bus::CacheBus;
use crate::config::Config;
use crate::db::Db;
use crate::error::ApiError;
use crate::models::*;
use crate::sessions::SessionRegistry;

/// Client address keying the per-IP auth window. The deployment model is a
/// single trusted reverse proxy (the TLS terminator), which appends the real
/// client as the final `X-Forwarded-For` hop; earlier hops are
/// client-supplied and must not key the limiter. Direct connections fall
/// back to the socket address.
pub struct AuthClientAddr(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthClientAddr {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let proxied = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|hops| hops.rsplit(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .map(String::from);
        let addr = match proxied {
            Some(hop) => hop,
            None => req
                .remote()
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        };
        Outcome::Success(AuthClientAddr(addr))
    }
}

/// Both failure modes answer identically so handles cannot be probed.
fn bad_credentials() -> ApiError {
    ApiError::Unauthenticated("invalid handle or password".to_string())
}

/// Per-IP auth window; successful requests clear it.
async fn check_auth_rate(bus: &CacheBus, config: &Config, ip: &str) -> Result<String, ApiError> {
    let key = format!("auth:{ip}");
    let rate = bus
        .rate_check(&key, config.auth_attempts_max, config.auth_window_secs)
        .await?;
    if !rate.allowed {
        return Err(ApiError::RateLimited {
            retry_after_secs: rate.retry_after_secs,
        });
    }
    Ok(key)
}

#[post("/auth/register", format = "json", data = "<body>")]
pub async fn register(
    db: &State<Db>,
    bus: &State<CacheBus>,
    config: &State<Config>,
    registry: &State<SessionRegistry>,
    addr: AuthClientAddr,
    body: Json<RegisterRequest>,
) -> Result<(Status, Json<TokenResponse>), ApiError> {
    let rate_key = check_auth_rate(bus, config, &addr.0).await?;

    let handle = body.handle.trim();
    if !valid_handle(handle) {
        return Err(ApiError::InvalidInput(
            "handle must be 3-50 characters, alphanumeric or underscore".to_string(),
        ));
    }
    if body.password.len() < 8 {
        return Err(ApiError::InvalidInput(
            "password must be at least 8 characters".to_string(),
        ));
    }
    if body.password != body.password_confirm {
        return Err(ApiError::InvalidInput("passwords do not match".to_string()));
    }

    let display_name = body
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(handle);

    let credential_hash = hash_password(&body.password)?;
    let user = db.create_user(handle, &credential_hash, display_name)?;
    let tokens = registry.create(&user, body.device.clone()).await?;

    bus.rate_clear(&rate_key).await.ok();
    Ok((Status::Created, Json(tokens)))
}

#[post("/auth/login", format = "json", data = "<body>")]
pub async fn login(
    db: &State<Db>,
    bus: &State<CacheBus>,
    config: &State<Config>,
    registry: &State<SessionRegistry>,
    addr: AuthClientAddr,
    body: Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let rate_key = check_auth_rate(bus, config, &addr.0).await?;

    let account = db
        .find_user_by_handle(body.handle.trim())?
        .ok_or_else(bad_credentials)?;
    if !verify_password(&body.password, &account.credential_hash) {
        return Err(bad_credentials());
    }

    let tokens = registry.create(&account.user, body.device.clone()).await?;
    bus.rate_clear(&rate_key).await.ok();
    Ok(Json(tokens))
}

#[post("/auth/refresh", format = "json", data = "<body>")]
pub async fn refresh(
    registry: &State<SessionRegistry>,
    body: Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = registry.resolve_by_refresh(&body.refresh_credential).await?;
    let access = registry.reissue_access(&session).await?;
    Ok(Json(serde_json::json!({ "access_credential": access })))
}

/// With a refresh credential: that session only. Without one, an access
/// credential invalidates every session of the caller.
#[post("/auth/logout", format = "json", data = "<body>")]
pub async fn logout(
    registry: &State<SessionRegistry>,
    authed: Option<Authed>,
    body: Json<LogoutRequest>,
) -> Result<Status, ApiError> {
    match (&body.refresh_credential, authed) {
        (Some(refresh_credential), _) => {
            let session = registry.resolve_by_refresh(refresh_credential).await?;
            registry.invalidate(&session.id).await?;
        }
        (None, Some(authed)) => {
            registry.invalidate_all(&authed.caller.user_id).await?;
        }
        (None, None) => {
            return Err(ApiError::Unauthenticated("missing credential".to_string()));
        }
    }
    Ok(Status::NoContent)
}
