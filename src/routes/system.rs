use rocket::serde::json::Json;
use rocket::{catch, get};

#[get("/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "courier-chat",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// --- Catchers ---
// Errors raised inside handlers carry their own JSON bodies; these cover
// failures before a handler runs (guards, missing routes, bad payloads).

#[catch(400)]
pub fn bad_request() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "bad request", "kind": "invalid-input"}))
}

#[catch(401)]
pub fn unauthorized() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "invalid credential", "kind": "unauthenticated"}))
}

#[catch(403)]
pub fn forbidden() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "access denied", "kind": "forbidden"}))
}

#[catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "not found", "kind": "not-found"}))
}

#[catch(409)]
pub fn conflict() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "conflict", "kind": "conflict"}))
}

#[catch(413)]
pub fn payload_too_large() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "payload too large", "kind": "too-large"}))
}

#[catch(422)]
pub fn unprocessable() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "malformed request body", "kind": "invalid-input"}))
}

#[catch(429)]
pub fn too_many_requests() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "too many requests", "kind": "rate-limited"}))
}

#[catch(500)]
pub fn internal_error() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "internal error", "kind": "internal"}))
}
