use std::env;

/// Runtime configuration, resolved once at startup and injected downward.
///
/// Environment variables (required unless a default is noted):
/// - `DATABASE_PATH` — SQLite file for the relational store
/// - `DATABASE_READER_PATH` — optional read-replica path (defaults to `DATABASE_PATH`)
/// - `BUS_URL` — cache/bus connection string; `redis://...` or `memory://`
/// - `BLOB_ENDPOINT`, `BLOB_BUCKET`, `BLOB_ACCESS_KEY` — external blob service
/// - `ACCESS_TOKEN_SECRET`, `REFRESH_TOKEN_SECRET` — signing secrets, ≥32 bytes, distinct
/// - `ACCESS_TOKEN_TTL_SECS` (default 900), `REFRESH_TOKEN_TTL_SECS` (default 604800)
/// - `ALLOWED_ORIGIN` — front-end origin for CORS
/// - `RATE_LIMIT_SENDS_PER_SEC` (default 10), `RATE_LIMIT_AUTH_ATTEMPTS` (default 5),
///   `RATE_LIMIT_AUTH_WINDOW_SECS` (default 900)
/// - `SEARCH_TOKENIZER` (default `porter unicode61`)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub reader_database_path: String,
    pub bus_url: String,
    pub blob_endpoint: String,
    pub blob_bucket: String,
    pub blob_access_key: String,
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub allowed_origin: String,
    pub sends_per_sec: usize,
    pub auth_attempts_max: usize,
    pub auth_window_secs: u64,
    pub search_tokenizer: String,
}

const MIN_SECRET_BYTES: usize = 32;

impl Config {
    /// Resolve configuration from the environment. Any missing or malformed
    /// required value is a startup error; the caller aborts.
    pub fn from_env() -> Result<Config, String> {
        let database_path = require("DATABASE_PATH")?;
        let reader_database_path =
            env::var("DATABASE_READER_PATH").unwrap_or_else(|_| database_path.clone());
        let bus_url = require("BUS_URL")?;
        if !bus_url.starts_with("redis://")
            && !bus_url.starts_with("rediss://")
            && !bus_url.starts_with("memory://")
        {
            return Err(format!(
                "BUS_URL must be redis://, rediss:// or memory:// (got '{bus_url}')"
            ));
        }

        let config = Config {
            database_path,
            reader_database_path,
            bus_url,
            blob_endpoint: require("BLOB_ENDPOINT")?,
            blob_bucket: require("BLOB_BUCKET")?,
            blob_access_key: require("BLOB_ACCESS_KEY")?,
            access_secret: require("ACCESS_TOKEN_SECRET")?,
            refresh_secret: require("REFRESH_TOKEN_SECRET")?,
            access_ttl_secs: parse_or("ACCESS_TOKEN_TTL_SECS", 900)?,
            refresh_ttl_secs: parse_or("REFRESH_TOKEN_TTL_SECS", 7 * 24 * 3600)?,
            allowed_origin: require("ALLOWED_ORIGIN")?,
            sends_per_sec: parse_or("RATE_LIMIT_SENDS_PER_SEC", 10)? as usize,
            auth_attempts_max: parse_or("RATE_LIMIT_AUTH_ATTEMPTS", 5)? as usize,
            auth_window_secs: parse_or("RATE_LIMIT_AUTH_WINDOW_SECS", 900)? as u64,
            search_tokenizer: env::var("SEARCH_TOKENIZER")
                .unwrap_or_else(|_| "porter unicode61".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.access_secret.len() < MIN_SECRET_BYTES {
            return Err(format!(
                "ACCESS_TOKEN_SECRET must be at least {MIN_SECRET_BYTES} bytes"
            ));
        }
        if self.refresh_secret.len() < MIN_SECRET_BYTES {
            return Err(format!(
                "REFRESH_TOKEN_SECRET must be at least {MIN_SECRET_BYTES} bytes"
            ));
        }
        if self.access_secret == self.refresh_secret {
            return Err("ACCESS_TOKEN_SECRET and REFRESH_TOKEN_SECRET must differ".to_string());
        }
        if self.access_ttl_secs <= 0 || self.refresh_ttl_secs <= 0 {
            return Err("token lifetimes must be positive".to_string());
        }
        if self.sends_per_sec == 0 {
            return Err("RATE_LIMIT_SENDS_PER_SEC must be positive".to_string());
        }
        Ok(())
    }
}

fn require(name: &str) -> Result<String, String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(format!("missing required environment variable {name}")),
    }
}

fn parse_or(name: &str, default: i64) -> Result<i64, String> {
    match env::var(name) {
        Ok(v) => v
            .parse::<i64>()
            .map_err(|_| format!("{name} must be an integer (got '{v}')")),
        Err(_) => Ok(default),
    }
}
