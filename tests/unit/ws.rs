use session_gateway::auth::Role;
use session_gateway::ws::dispatch::allowed_roles;
use session_gateway::ws::outbound::{OutboundFrame, OutboundQueue, PushOutcome};

#[test]
fn outbound_frames_keep_push_order() {
    let queue = OutboundQueue::new(16);
    for i in 0..10 {
        queue.push(OutboundFrame::normal(format!("frame-{}", i)));
    }
    for i in 0..10 {
        assert_eq!(queue.try_pop().unwrap().payload, format!("frame-{}", i));
    }
}

#[test]
fn backpressure_drops_oldest_non_critical_frame() {
    let queue = OutboundQueue::new(3);
    queue.push(OutboundFrame::normal("a".to_string()));
    queue.push(OutboundFrame::normal("b".to_string()));
    queue.push(OutboundFrame::normal("c".to_string()));

    assert_eq!(
        queue.push(OutboundFrame::normal("d".to_string())),
        PushOutcome::DisplacedOldest
    );

    let payloads: Vec<_> = std::iter::from_fn(|| queue.try_pop())
        .map(|f| f.payload)
        .collect();
    assert_eq!(payloads, vec!["b", "c", "d"]);
}

#[test]
fn lifecycle_frames_displace_rather_than_drop() {
    let queue = OutboundQueue::new(2);
    queue.push(OutboundFrame::normal("chat-1".to_string()));
    queue.push(OutboundFrame::normal("chat-2".to_string()));

    let logout = OutboundFrame::lifecycle(r#"{"type":"logout"}"#.to_string());
    assert_eq!(queue.push(logout), PushOutcome::DisplacedOldest);

    let frames: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().any(|f| f.drain_after));
}

#[test]
fn role_gate_matches_dispatch_table() {
    // type -> allowed roles, per the wire protocol.
    for message_type in ["ping", "pong", "update_api_key", "chat_message"] {
        let roles = allowed_roles(message_type).unwrap();
        assert!(roles.contains(&Role::User), "{} should allow user", message_type);
        assert!(roles.contains(&Role::Admin));
    }

    let admin_only = allowed_roles("admin_command").unwrap();
    assert!(!admin_only.contains(&Role::User));

    assert!(allowed_roles("subscribe").is_none());
    assert!(allowed_roles("logout").is_none());
}
