use rocket::http::{ContentType, Status};

use crate::common::{bearer, create_direct, register, test_client};

#[test]
fn test_eleventh_send_within_a_second_is_limited() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);

    for i in 0..10 {
        let res = client
            .post(format!("/chats/{chat_id}/messages"))
            .header(ContentType::JSON)
            .header(bearer(&alice))
            .body(format!(r#"{{"body":"burst {i}"}}"#))
            .dispatch();
        assert_eq!(res.status(), Status::Created, "send {i} should pass");
    }

    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"body":"one too many"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::TooManyRequests);
    assert!(res.headers().get_one("Retry-After").is_some());
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "rate-limited");

    // The limit is per user: bob can still send.
    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"body":"not affected"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
}

#[test]
fn test_failed_auth_attempts_are_limited_per_ip() {
    let client = test_client();
    register(&client, "alice");

    for _ in 0..5 {
        let res = client
            .post("/auth/login")
            .header(ContentType::JSON)
            .body(r#"{"handle":"alice","password":"WrongPass1!"}"#)
            .dispatch();
        assert_eq!(res.status(), Status::Unauthorized);
    }

    let res = client
        .post("/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"handle":"alice","password":"WrongPass1!"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::TooManyRequests);
    assert!(res.headers().get_one("Retry-After").is_some());
}

#[test]
fn test_successful_auth_does_not_consume_the_window() {
    let client = test_client();
    register(&client, "alice");

    // More successful logins than the failure cap.
    for _ in 0..7 {
        let res = client
            .post("/auth/login")
            .header(ContentType::JSON)
            .body(r#"{"handle":"alice","password":"Secret42!"}"#)
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
    }
}
