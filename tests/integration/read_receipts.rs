use rocket::http::Status;

use crate::common::{bearer, create_direct, create_group, register, send_message, test_client};

#[test]
fn test_mark_read_flips_delivery_row_and_unread() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "read me");

    let res = client
        .post(format!("/messages/{message_id}/read"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::NoContent);

    let db = client.db();
    let deliveries = db.deliveries_for_message(&message_id).unwrap();
    assert_eq!(deliveries[0].status.as_str(), "read");
    assert!(deliveries[0].read_at.is_some());

    let res = client.get("/chats").header(bearer(&bob)).dispatch();
    let chats: serde_json::Value = res.into_json().unwrap();
    assert_eq!(chats.as_array().unwrap()[0]["unread_count"], 0);

    // Marking again is a no-op, not an error.
    let res = client
        .post(format!("/messages/{message_id}/read"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::NoContent);
}

#[test]
fn test_sender_has_no_delivery_row_to_read() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "mine");

    let res = client
        .post(format!("/messages/{message_id}/read"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_mark_chat_read_clears_everything() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let carol = register(&client, "carol");
    let chat_id = create_group(&client, &alice, "team", &[&bob, &carol]);

    for i in 0..3 {
        send_message(&client, &alice, &chat_id, &format!("m{i}"));
    }
    send_message(&client, &carol, &chat_id, "from carol");

    // Bob has the system message plus four real ones.
    let res = client.get("/chats").header(bearer(&bob)).dispatch();
    let chats: serde_json::Value = res.into_json().unwrap();
    assert_eq!(chats.as_array().unwrap()[0]["unread_count"], 5);

    let res = client
        .post(format!("/chats/{chat_id}/read"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["marked_read"], 5);

    let res = client.get("/chats").header(bearer(&bob)).dispatch();
    let chats: serde_json::Value = res.into_json().unwrap();
    assert_eq!(chats.as_array().unwrap()[0]["unread_count"], 0);

    // Alice's own unread is untouched by bob's receipts.
    let res = client.get("/chats").header(bearer(&alice)).dispatch();
    let chats: serde_json::Value = res.into_json().unwrap();
    assert_eq!(chats.as_array().unwrap()[0]["unread_count"], 1);
}

#[test]
fn test_non_participant_cannot_mark_chat_read() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let mallory = register(&client, "mallory");
    let chat_id = create_direct(&client, &alice, &bob);
    send_message(&client, &alice, &chat_id, "private");

    let res = client
        .post(format!("/chats/{chat_id}/read"))
        .header(bearer(&mallory))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}
