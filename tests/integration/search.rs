use rocket::http::Status;

use crate::common::{bearer, create_direct, register, send_message, test_client};

#[test]
fn test_search_is_scoped_to_membership() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let carol = register(&client, "carol");
    let ab = create_direct(&client, &alice, &bob);
    let ac = create_direct(&client, &alice, &carol);

    send_message(&client, &alice, &ab, "the roadmap is ready");
    send_message(&client, &alice, &ac, "the roadmap is secret");

    // Bob only sees the hit from his own chat.
    let res = client
        .get("/search?q=roadmap")
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let hits: serde_json::Value = res.into_json().unwrap();
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["message"]["chat_id"].as_str().unwrap(), ab);

    // Alice sees both, and can narrow by chat.
    let res = client
        .get("/search?q=roadmap")
        .header(bearer(&alice))
        .dispatch();
    let hits: serde_json::Value = res.into_json().unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 2);

    let res = client
        .get(format!("/search?q=roadmap&chat_id={ac}"))
        .header(bearer(&alice))
        .dispatch();
    let hits: serde_json::Value = res.into_json().unwrap();
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["message"]["chat_id"].as_str().unwrap(), ac);
}

#[test]
fn test_deleted_messages_drop_out_of_search() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    let message_id = send_message(&client, &alice, &chat_id, "ephemeral announcement");

    let res = client
        .get("/search?q=ephemeral")
        .header(bearer(&bob))
        .dispatch();
    let hits: serde_json::Value = res.into_json().unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 1);

    client
        .delete(format!("/messages/{message_id}"))
        .header(bearer(&alice))
        .dispatch();

    let res = client
        .get("/search?q=ephemeral")
        .header(bearer(&bob))
        .dispatch();
    let hits: serde_json::Value = res.into_json().unwrap();
    assert!(hits.as_array().unwrap().is_empty());
}

#[test]
fn test_search_rejects_empty_query_and_stems_terms() {
    let client = test_client();
    let alice = register(&client, "alice");
    let bob = register(&client, "bob");
    let chat_id = create_direct(&client, &alice, &bob);
    send_message(&client, &alice, &chat_id, "deploying the releases");

    let res = client
        .get("/search?q=%20%20")
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    // Porter stemming: "deploy" matches "deploying".
    let res = client
        .get("/search?q=deploy")
        .header(bearer(&bob))
        .dispatch();
    let hits: serde_json::Value = res.into_json().unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 1);
}
