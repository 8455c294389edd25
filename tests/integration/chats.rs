use rocket::http::{ContentType, Status};

use crate::common::{bearer, create_direct, create_group, register, send_message, test_client};

// --- Direct chats ---

#[test]
fn test_direct_chat_is_idempotent_and_symmetric() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");

    let res = client
        .post("/chats/direct")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"contact_id":"{}"}}"#, bob.id))
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let first: serde_json::Value = res.into_json().unwrap();
    let chat_id = first["id"].as_str().unwrap().to_string();
    assert_eq!(first["kind"], "direct");

    // Bob opening from his side lands on the same chat, 200 this time.
    let res = client
        .post("/chats/direct")
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"contact_id":"{}"}}"#, alice.id))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let second: serde_json::Value = res.into_json().unwrap();
    assert_eq!(second["id"].as_str().unwrap(), chat_id);

    // And alice retrying is still the same chat.
    let res = client
        .post("/chats/direct")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"contact_id":"{}"}}"#, bob.id))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let third: serde_json::Value = res.into_json().unwrap();
    assert_eq!(third["id"].as_str().unwrap(), chat_id);
}

#[test]
fn test_direct_chat_with_self_rejected() {
    let client = test_client();
    let alice = register(&client, "alice");
    let res = client
        .post("/chats/direct")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"contact_id":"{}"}}"#, alice.id))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_direct_chat_with_unknown_user_is_404() {
    let client = test_client();
    let alice = register(&client, "alice");
    let res = client
        .post("/chats/direct")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"contact_id":"00000000-0000-0000-0000-000000000000"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

// --- Groups ---

#[test]
fn test_group_creation_emits_system_message() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let carol = register(&client, "carol");
    let chat_id = create_group(&client, &alice, "the team", &[&bob, &carol]);

    let res = client
        .get(format!("/chats/{chat_id}/messages"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["kind"], "system");
    assert_eq!(messages[0]["body"], "created the group");
    assert_eq!(messages[0]["sender_id"].as_str().unwrap(), alice.id);

    // Owner role is recorded.
    let res = client
        .get(format!("/chats/{chat_id}/participants"))
        .header(bearer(&alice))
        .dispatch();
    let participants: serde_json::Value = res.into_json().unwrap();
    let owner = participants
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["user_id"] == alice.id.as_str())
        .unwrap();
    assert_eq!(owner["role"], "owner");
}

#[test]
fn test_group_requires_name_and_members() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");

    let res = client
        .post("/chats/group")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"name":"  ","participant_ids":["{}"]}}"#, bob.id))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post("/chats/group")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"name":"team","participant_ids":[]}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_member_can_leave_and_rejoin_with_fresh_joined_at() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_group(&client, &alice, "team", &[&bob]);

    let res = client
        .get(format!("/chats/{chat_id}/participants"))
        .header(bearer(&alice))
        .dispatch();
    let before: serde_json::Value = res.into_json().unwrap();
    let bob_joined_before = before
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["user_id"] == bob.id.as_str())
        .unwrap()["joined_at"]
        .as_str()
        .unwrap()
        .to_string();

    // Bob leaves.
    let res = client
        .delete(format!("/chats/{chat_id}/participants/{}", bob.id))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::NoContent);

    // He can no longer read the chat.
    let res = client
        .get(format!("/chats/{chat_id}/messages"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    // Re-added with a fresh membership.
    let res = client
        .post(format!("/chats/{chat_id}/participants"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"user_ids":["{}"]}}"#, bob.id))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["added"].as_array().unwrap().len(), 1);

    let res = client
        .get(format!("/chats/{chat_id}/participants"))
        .header(bearer(&alice))
        .dispatch();
    let after: serde_json::Value = res.into_json().unwrap();
    let bob_joined_after = after
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["user_id"] == bob.id.as_str())
        .unwrap()["joined_at"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(bob_joined_after > bob_joined_before);
}

#[test]
fn test_owner_cannot_leave_but_can_delete() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_group(&client, &alice, "team", &[&bob]);

    let res = client
        .delete(format!("/chats/{chat_id}/participants/{}", alice.id))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .delete(format!("/chats/{chat_id}"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::NoContent);

    // Deleted chats vanish from listings.
    let res = client.get("/chats").header(bearer(&bob)).dispatch();
    let chats: serde_json::Value = res.into_json().unwrap();
    assert!(chats.as_array().unwrap().is_empty());
}

#[test]
fn test_group_rename_is_admin_gated() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_group(&client, &alice, "team", &[&bob]);

    let res = client
        .patch(format!("/chats/{chat_id}"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"name":"bob's team"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .patch(format!("/chats/{chat_id}"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"name":"renamed team","avatar_ref":"blobs/team.png"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["name"], "renamed team");
    assert_eq!(body["avatar_ref"], "blobs/team.png");
}

#[test]
fn test_only_admins_manage_participants() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let carol = register(&client, "carol");
    let chat_id = create_group(&client, &alice, "team", &[&bob]);

    let res = client
        .post(format!("/chats/{chat_id}/participants"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"user_ids":["{}"]}}"#, carol.id))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    // A member cannot remove another member either.
    let res = client
        .delete(format!("/chats/{chat_id}/participants/{}", alice.id))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_direct_chats_have_fixed_membership() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let carol = register(&client, "carol");
    let chat_id = create_direct(&client, &alice, &bob);

    let res = client
        .post(format!("/chats/{chat_id}/participants"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"user_ids":["{}"]}}"#, carol.id))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

// --- Chat listing ---

#[test]
fn test_chat_list_carries_unread_and_last_message() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);

    send_message(&client, &alice, &chat_id, "first");
    let last = send_message(&client, &alice, &chat_id, "second");

    let res = client.get("/chats").header(bearer(&bob)).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let chats: serde_json::Value = res.into_json().unwrap();
    let chats = chats.as_array().unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["id"].as_str().unwrap(), chat_id);
    assert_eq!(chats[0]["unread_count"], 2);
    assert_eq!(chats[0]["last_message"]["id"].as_str().unwrap(), last);

    // The sender has nothing unread.
    let res = client.get("/chats").header(bearer(&alice)).dispatch();
    let chats: serde_json::Value = res.into_json().unwrap();
    assert_eq!(chats.as_array().unwrap()[0]["unread_count"], 0);
}

#[test]
fn test_non_participant_cannot_read_chat() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let mallory = register(&client, "mallory");
    let chat_id = create_direct(&client, &alice, &bob);
    send_message(&client, &alice, &chat_id, "private");

    let res = client
        .get(format!("/chats/{chat_id}/messages"))
        .header(bearer(&mallory))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/chats/{chat_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&mallory))
        .body(r#"{"body":"let me in"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "forbidden");
}
