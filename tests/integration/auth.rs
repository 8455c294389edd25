use rocket::http::{ContentType, Header, Status};

use crate::common::{bearer, register, test_client};

#[test]
fn test_register_issues_tokens() {
    let client = test_client();
    let alice = register(&client, "alice");
    assert!(!alice.access.is_empty());
    assert!(!alice.refresh.is_empty());

    let res = client.get("/users/me").header(bearer(&alice)).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["handle"], "alice");
}

#[test]
fn test_duplicate_handle_conflicts() {
    let client = test_client();
    register(&client, "alice");
    let res = client
        .post("/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"handle":"alice","password":"Secret42!","password_confirm":"Secret42!"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "conflict");
}

#[test]
fn test_password_confirm_mismatch() {
    let client = test_client();
    let res = client
        .post("/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"handle":"alice","password":"Secret42!","password_confirm":"Different1!"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_login_failure_does_not_leak_handle_existence() {
    let client = test_client();
    register(&client, "alice");

    let wrong_password = client
        .post("/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"handle":"alice","password":"WrongPass1!"}"#)
        .dispatch();
    assert_eq!(wrong_password.status(), Status::Unauthorized);
    let wrong_password: serde_json::Value = wrong_password.into_json().unwrap();

    let unknown_handle = client
        .post("/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"handle":"nobody","password":"WrongPass1!"}"#)
        .dispatch();
    assert_eq!(unknown_handle.status(), Status::Unauthorized);
    let unknown_handle: serde_json::Value = unknown_handle.into_json().unwrap();

    assert_eq!(wrong_password["error"], unknown_handle["error"]);
}

#[test]
fn test_register_logout_login_cycle() {
    let client = test_client();
    let alice = register(&client, "alice");

    // Logout the session via its refresh credential.
    let res = client
        .post("/auth/logout")
        .header(ContentType::JSON)
        .body(format!(r#"{{"refresh_credential":"{}"}}"#, alice.refresh))
        .dispatch();
    assert_eq!(res.status(), Status::NoContent);

    // The old access credential no longer resolves.
    let res = client.get("/users/me").header(bearer(&alice)).dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    // Fresh login works and yields a usable credential.
    let res = client
        .post("/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"handle":"alice","password":"Secret42!"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let access = body["access_credential"].as_str().unwrap();

    let res = client
        .get("/users/me")
        .header(Header::new("Authorization", format!("Bearer {access}")))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["handle"], "alice");
}

#[test]
fn test_refresh_yields_new_access_credential() {
    let client = test_client();
    let alice = register(&client, "alice");

    let res = client
        .post("/auth/refresh")
        .header(ContentType::JSON)
        .body(format!(r#"{{"refresh_credential":"{}"}}"#, alice.refresh))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let access = body["access_credential"].as_str().unwrap();
    assert!(!access.is_empty());

    let res = client
        .get("/users/me")
        .header(Header::new("Authorization", format!("Bearer {access}")))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn test_refresh_credential_is_not_an_access_credential() {
    let client = test_client();
    let alice = register(&client, "alice");
    let res = client
        .get("/users/me")
        .header(Header::new("Authorization", format!("Bearer {}", alice.refresh)))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_logout_without_body_invalidates_all_sessions() {
    let client = test_client();
    let alice = register(&client, "alice");

    // Second device
    let res = client
        .post("/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"handle":"alice","password":"Secret42!"}"#)
        .dispatch();
    let second: serde_json::Value = res.into_json().unwrap();
    let second_access = second["access_credential"].as_str().unwrap().to_string();

    let res = client
        .post("/auth/logout")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body("{}")
        .dispatch();
    assert_eq!(res.status(), Status::NoContent);

    for token in [alice.access.as_str(), second_access.as_str()] {
        let res = client
            .get("/users/me")
            .header(Header::new("Authorization", format!("Bearer {token}")))
            .dispatch();
        assert_eq!(res.status(), Status::Unauthorized);
    }
}

#[test]
fn test_missing_credential_is_unauthorized() {
    let client = test_client();
    let res = client.get("/chats").dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "unauthenticated");
}
