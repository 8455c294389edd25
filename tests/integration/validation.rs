use rocket::http::{ContentType, Status};

use crate::common::test_client;

fn try_register(client: &rocket::local::blocking::Client, handle: &str) -> Status {
    client
        .post("/auth/register")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"handle":"{handle}","password":"Secret42!","password_confirm":"Secret42!"}}"#
        ))
        .dispatch()
        .status()
}

#[test]
fn test_handle_rules() {
    let client = test_client();
    assert_eq!(try_register(&client, "abc"), Status::Created);
    assert_eq!(try_register(&client, "abcDEF_123"), Status::Created);
    assert_eq!(try_register(&client, "ab"), Status::BadRequest);
    assert_eq!(try_register(&client, "abc-def"), Status::BadRequest);
    assert_eq!(try_register(&client, &"x".repeat(51)), Status::BadRequest);
    assert_eq!(try_register(&client, &"y".repeat(50)), Status::Created);
}

#[test]
fn test_short_password_rejected() {
    let client = test_client();
    let res = client
        .post("/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"handle":"alice","password":"short","password_confirm":"short"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_malformed_json_is_422() {
    let client = test_client();
    let res = client
        .post("/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"handle": "#)
        .dispatch();
    assert_eq!(res.status(), Status::UnprocessableEntity);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "invalid-input");
}
