use rocket::http::{ContentType, Status};

use crate::common::{bearer, create_direct, register, send_message, test_client};

#[test]
fn test_reaction_lifecycle() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "react to me");

    let res = client
        .post(format!("/messages/{message_id}/reactions"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"glyph":"👍"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let reaction: serde_json::Value = res.into_json().unwrap();
    let reaction_id = reaction["id"].as_str().unwrap().to_string();
    assert_eq!(reaction["glyph"], "👍");
    assert_eq!(reaction["user_id"].as_str().unwrap(), bob.id);

    // Same (message, user, glyph) is unique.
    let res = client
        .post(format!("/messages/{message_id}/reactions"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"glyph":"👍"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);

    // A different glyph from the same user is fine.
    let res = client
        .post(format!("/messages/{message_id}/reactions"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"glyph":"🎉"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);

    let res = client
        .get(format!("/messages/{message_id}/reactions"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let listed: serde_json::Value = res.into_json().unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 2);

    let res = client
        .delete(format!("/messages/{message_id}/reactions/{reaction_id}"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::NoContent);

    let res = client
        .get(format!("/messages/{message_id}/reactions"))
        .header(bearer(&alice))
        .dispatch();
    let listed: serde_json::Value = res.into_json().unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed.as_array().unwrap()[0]["glyph"], "🎉");

    // Removing it twice is a 404.
    let res = client
        .delete(format!("/messages/{message_id}/reactions/{reaction_id}"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_only_the_reactor_can_remove() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "hello");

    let res = client
        .post(format!("/messages/{message_id}/reactions"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"glyph":"❤️"}"#)
        .dispatch();
    let reaction: serde_json::Value = res.into_json().unwrap();
    let reaction_id = reaction["id"].as_str().unwrap();

    let res = client
        .delete(format!("/messages/{message_id}/reactions/{reaction_id}"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_reactions_require_participation_and_sane_glyphs() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let mallory = register(&client, "mallory");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "hello");

    let res = client
        .post(format!("/messages/{message_id}/reactions"))
        .header(ContentType::JSON)
        .header(bearer(&mallory))
        .body(r#"{"glyph":"👀"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/messages/{message_id}/reactions"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"glyph":"way too long for a glyph"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post(format!("/messages/{message_id}/reactions"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"glyph":"  "}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}
