use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;

use courier_chat::bus::CacheBus;
use courier_chat::config::Config;
use courier_chat::db::Db;

/// Wrapper around Client that auto-deletes the temp DB on drop.
/// Uses Option<Client> so the DB connection is released before the file
/// goes away (WAL mode holds it).
pub struct TestClient {
    client: Option<Client>,
    pub db_path: String,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        drop(self.client.take());
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path));
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

impl TestClient {
    /// Direct store handle over the same database file, for assertions the
    /// REST surface does not expose (delivery rows, participants).
    pub fn db(&self) -> Db {
        Db::new(&self.db_path, "porter unicode61")
    }
}

pub fn test_config(db_path: &str) -> Config {
    Config {
        database_path: db_path.to_string(),
        reader_database_path: db_path.to_string(),
        bus_url: "memory://".to_string(),
        blob_endpoint: "http://blobs.local".to_string(),
        blob_bucket: "attachments".to_string(),
        blob_access_key: "test-key".to_string(),
        access_secret: "integration-access-secret-0123456789ab".to_string(),
        refresh_secret: "integration-refresh-secret-0123456789a".to_string(),
        access_ttl_secs: 900,
        refresh_ttl_secs: 604800,
        allowed_origin: "http://localhost:5173".to_string(),
        sends_per_sec: 10,
        auth_attempts_max: 5,
        auth_window_secs: 900,
        search_tokenizer: "porter unicode61".to_string(),
    }
}

pub fn test_client() -> TestClient {
    // Unique temp DB per test (avoids parallel test contention)
    let db_path = format!(
        "/tmp/courier_test_{}.db",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
    );
    let rocket = courier_chat::build_rocket(test_config(&db_path), CacheBus::memory());
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient { client: Some(client), db_path }
}

/// Registered user as seen by the tests: ids plus both credentials.
pub struct TestUser {
    pub id: String,
    pub handle: String,
    pub access: String,
    pub refresh: String,
    pub session_id: String,
}

pub fn register(client: &Client, handle: &str) -> TestUser {
    let res = client
        .post("/auth/register")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"handle":"{handle}","password":"Secret42!","password_confirm":"Secret42!"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Created, "registration of {handle} failed");
    let body: serde_json::Value = res.into_json().unwrap();
    TestUser {
        id: body["user"]["id"].as_str().unwrap().to_string(),
        handle: handle.to_string(),
        access: body["access_credential"].as_str().unwrap().to_string(),
        refresh: body["refresh_credential"].as_str().unwrap().to_string(),
        session_id: body["session_id"].as_str().unwrap().to_string(),
    }
}

pub fn bearer(user: &TestUser) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {}", user.access))
}

/// Direct chat between two users; returns the chat id.
pub fn create_direct(client: &Client, actor: &TestUser, other: &TestUser) -> String {
    let res = client
        .post("/chats/direct")
        .header(ContentType::JSON)
        .header(bearer(actor))
        .body(format!(r#"{{"contact_id":"{}"}}"#, other.id))
        .dispatch();
    let status = res.status();
    assert!(
        status == Status::Created || status == Status::Ok,
        "direct chat creation failed: {status}"
    );
    let body: serde_json::Value = res.into_json().unwrap();
    body["id"].as_str().unwrap().to_string()
}

/// Group chat owned by `actor` with the given members; returns the chat id.
pub fn create_group(client: &Client, actor: &TestUser, name: &str, members: &[&TestUser]) -> String {
    let ids: Vec<String> = members.iter().map(|m| format!("\"{}\"", m.id)).collect();
    let res = client
        .post("/chats/group")
        .header(ContentType::JSON)
        .header(bearer(actor))
        .body(format!(
            r#"{{"name":"{name}","participant_ids":[{}]}}"#,
            ids.join(",")
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Created, "group creation failed");
    let body: serde_json::Value = res.into_json().unwrap();
    body["id"].as_str().unwrap().to_string()
}

/// Sends a message and returns its id.
pub fn send_message(client: &Client, sender: &TestUser, chat_id: &str, body: &str) -> String {
    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(sender))
        .body(format!(r#"{{"body":"{body}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Created, "send failed");
    let body: serde_json::Value = res.into_json().unwrap();
    body["id"].as_str().unwrap().to_string()
}
