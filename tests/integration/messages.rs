use rocket::http::{ContentType, Status};

use crate::common::{bearer, create_direct, register, send_message, test_client};

#[test]
fn test_send_creates_delivery_rows_for_recipients_only() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "hi bob");

    let db = client.db();
    let deliveries = db.deliveries_for_message(&message_id).unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].user_id, bob.id);
    assert_eq!(deliveries[0].status.as_str(), "sent");
}

#[test]
fn test_send_then_edit_then_get_returns_latest_body() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "first draft");

    let res = client
        .patch(format!("/messages/{message_id}"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"body":"final version"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .get(format!("/messages/{message_id}"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["body"], "final version");
    assert_eq!(body["edited"], true);
    assert!(body["edited_at"].is_string());

    // The audit trail holds the prior body.
    let res = client
        .get(format!("/messages/{message_id}/edits"))
        .header(bearer(&alice))
        .dispatch();
    let edits: serde_json::Value = res.into_json().unwrap();
    let edits = edits.as_array().unwrap();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0]["prior_body"], "first draft");
}

#[test]
fn test_only_sender_edits_or_deletes() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "mine");

    let res = client
        .patch(format!("/messages/{message_id}"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"body":"hijacked"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .delete(format!("/messages/{message_id}"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_soft_delete_leaves_tombstone_and_delivery_rows() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "regrettable");

    let res = client
        .delete(format!("/messages/{message_id}"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["deleted"], true);
    assert_eq!(body["body"], "[deleted]");

    let res = client
        .get(format!("/messages/{message_id}"))
        .header(bearer(&bob))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["body"], "[deleted]");
    assert_eq!(body["deleted"], true);

    // Historical delivery rows persist.
    let db = client.db();
    assert_eq!(db.deliveries_for_message(&message_id).unwrap().len(), 1);

    // A deleted message cannot be edited again.
    let res = client
        .patch(format!("/messages/{message_id}"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"body":"resurrect"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_body_boundaries() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);

    let exactly_max = "x".repeat(10_000);
    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"body":"{exactly_max}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Created);

    let one_over = "x".repeat(10_001);
    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"body":"{one_over}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::PayloadTooLarge);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "too-large");

    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"body":"   "}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_body_is_sanitized() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);

    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"body":"<b>bold</b> <script>alert(1)</script> plain"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["body"], "<b>bold</b> alert(1) plain");
}

#[test]
fn test_reply_to_must_reference_same_chat() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let carol = register(&client, "carol");
    let ab = create_direct(&client, &alice, &bob);
    let ac = create_direct(&client, &alice, &carol);
    let other_chat_msg = send_message(&client, &alice, &ac, "elsewhere");

    let res = client
        .post(format!("/chats/{ab}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"body":"reply","reply_to_id":"{other_chat_msg}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let target = send_message(&client, &alice, &ab, "target");
    let res = client
        .post(format!("/chats/{ab}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"body":"reply","reply_to_id":"{target}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["reply_to_id"].as_str().unwrap(), target);
}

#[test]
fn test_image_messages_require_descriptors() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);

    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"body":"look","kind":"image"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(
            r#"{"body":"look","kind":"image","metadata":{"images":[{
                "file_name":"cat.png","mime_type":"image/png","byte_size":2048,
                "original_ref":"blobs/cat","original_url":"https://blobs.local/cat.png"
            }]}}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "image");
}

#[test]
fn test_clients_cannot_send_system_messages() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);

    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"body":"fake join","kind":"system"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_pagination_is_reverse_chronological_with_cursor() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);

    let mut sent = Vec::new();
    for i in 0..5 {
        sent.push(send_message(&client, &alice, &chat_id, &format!("m{i}")));
    }

    let res = client
        .get(format!("/chats/{chat_id}/messages?limit=2"))
        .header(bearer(&bob))
        .dispatch();
    let page1: serde_json::Value = res.into_json().unwrap();
    let messages = page1["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["id"].as_str().unwrap(), sent[4]);
    assert_eq!(messages[1]["id"].as_str().unwrap(), sent[3]);
    let cursor = page1["next_cursor"].as_str().unwrap();

    let res = client
        .get(format!("/chats/{chat_id}/messages?limit=2&cursor={cursor}"))
        .header(bearer(&bob))
        .dispatch();
    let page2: serde_json::Value = res.into_json().unwrap();
    let messages = page2["messages"].as_array().unwrap();
    assert_eq!(messages[0]["id"].as_str().unwrap(), sent[2]);
    assert_eq!(messages[1]["id"].as_str().unwrap(), sent[1]);

    // Malformed cursors are a validation error.
    let res = client
        .get(format!("/chats/{chat_id}/messages?cursor=%21%21%21"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}
