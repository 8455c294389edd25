use rocket::http::{ContentType, Status};

use crate::common::{bearer, create_direct, register, test_client};

#[test]
fn test_profile_update() {
    let client = test_client();
    let alice = register(&client, "alice");

    let res = client
        .put("/users/me")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"display_name":"Alice Liddell","avatar_ref":"blobs/alice.png"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["display_name"], "Alice Liddell");
    assert_eq!(body["avatar_ref"], "blobs/alice.png");
    // Untouched fields survive a partial update.
    assert_eq!(body["handle"], "alice");
}

#[test]
fn test_away_status_is_published_presence() {
    let client = test_client();
    let alice = register(&client, "alice");
    let res = client
        .put("/users/me")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"status":"away"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "away");
}

#[test]
fn test_handle_prefix_search() {
    let client = test_client();
    let alice = register(&client, "alice");
    register(&client, "alicia");
    register(&client, "bob");

    let res = client
        .get("/users/search?q=ali")
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let handles: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["handle"].as_str().unwrap())
        .collect();
    assert_eq!(handles, vec!["alice", "alicia"]);

    let res = client
        .get("/users/search?q=ali&limit=1")
        .header(bearer(&alice))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[test]
fn test_profile_visibility_requires_shared_chat() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let carol = register(&client, "carol");

    // No shared chat yet.
    let res = client
        .get(format!("/users/{}", bob.id))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    create_direct(&client, &alice, &bob);
    let res = client
        .get(format!("/users/{}", bob.id))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["handle"], "bob");

    // Carol still can't see bob.
    let res = client
        .get(format!("/users/{}", bob.id))
        .header(bearer(&carol))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    // Self-view always works.
    let res = client
        .get(format!("/users/{}", carol.id))
        .header(bearer(&carol))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}
