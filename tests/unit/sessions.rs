use serde_json::json;
use session_gateway::session::{DEFAULT_CHAT_ID, Session, merge_json};
use std::collections::HashMap;

#[test]
fn patch_sequences_deep_merge_with_last_writer_wins() {
    // Applying p1..pn in order must equal the deep-merge of the sequence,
    // regardless of how the fields interleave.
    let sequences = vec![
        (
            vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})],
            json!({"a": 3}),
        ),
        (
            vec![json!({"a": {"x": 1}}), json!({"a": {"y": 2}})],
            json!({"a": {"x": 1, "y": 2}}),
        ),
        (
            vec![
                json!({"api_key": "K1", "meta": {"v": 1}}),
                json!({"meta": {"v": 2, "w": 3}}),
                json!({"api_key": "K2"}),
            ],
            json!({"api_key": "K2", "meta": {"v": 2, "w": 3}}),
        ),
        (
            // A scalar overwriting an object wipes the subtree.
            vec![json!({"a": {"x": 1}}), json!({"a": 5}), json!({"a": {"y": 2}})],
            json!({"a": {"y": 2}}),
        ),
    ];

    for (patches, expected) in sequences {
        let mut data = json!({});
        for patch in &patches {
            merge_json(&mut data, patch);
        }
        assert_eq!(data, expected);
    }
}

#[test]
fn session_survives_store_round_trip() {
    let mut session = Session::new("alice", Some("support"));
    session.data = json!({"api_key": "K", "nested": {"a": [1, 2]}});

    let fields: HashMap<String, String> = session.to_fields().into_iter().collect();
    let restored = Session::from_fields(&session.session_id, &fields).unwrap();

    assert_eq!(restored.session_id, session.session_id);
    assert_eq!(restored.user_id, "alice");
    assert_eq!(restored.chat_id, "support");
    assert_eq!(restored.data, session.data);
    assert_eq!(restored.created_at, session.created_at);
}

#[test]
fn blank_chat_id_falls_back_to_default() {
    assert_eq!(Session::new("alice", Some("")).chat_id, DEFAULT_CHAT_ID);
    assert_eq!(Session::new("alice", Some("  ")).chat_id, DEFAULT_CHAT_ID);
    assert_eq!(Session::new("alice", None).chat_id, DEFAULT_CHAT_ID);
}

#[test]
fn expiry_is_strictly_past_timeout() {
    let mut session = Session::new("alice", None);
    session.last_access = 10_000;

    assert!(!session.is_expired(1800, 10_000));
    assert!(!session.is_expired(1800, 11_800));
    assert!(session.is_expired(1800, 11_801));
}
