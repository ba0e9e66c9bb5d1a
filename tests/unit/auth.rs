use session_gateway::auth::{Role, TokenService};

const TEST_SECRET: &str = "integration-test-secret-key";

#[test]
fn login_token_round_trip_preserves_subject_and_role() {
    let tokens = TokenService::new(TEST_SECRET, 1800);

    // For any (user, role), issue then verify yields the same principal.
    let users = [
        ("alice", Role::User),
        ("bob", Role::User),
        ("root", Role::Admin),
        ("user_with_underscores", Role::User),
        ("x", Role::Admin),
    ];

    for (username, role) in users {
        let (token, claims) = tokens.issue(username, role).unwrap();
        assert_eq!(claims.sub, username);
        assert!(claims.exp > claims.iat);
        assert_eq!(claims.exp - claims.iat, 1800);

        let principal = tokens.principal(&token).unwrap();
        assert_eq!(principal.username, username);
        assert_eq!(principal.role, role);
    }
}

#[test]
fn tokens_are_rejected_across_secrets() {
    let issuer = TokenService::new("first-secret-key-value", 1800);
    let verifier = TokenService::new("second-secret-key-value", 1800);

    let (token, _) = issuer.issue("alice", Role::User).unwrap();
    assert!(issuer.verify(&token).is_ok());
    assert!(verifier.verify(&token).is_err());
}

#[test]
fn garbage_tokens_are_rejected() {
    let tokens = TokenService::new(TEST_SECRET, 1800);
    for garbage in ["", "abc", "a.b.c", "Bearer x"] {
        assert!(tokens.verify(garbage).is_err(), "accepted {:?}", garbage);
    }
}
