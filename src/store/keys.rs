//! Key namespaces used in the shared store. Every component goes through
//! these constructors so the layout stays in one place.

pub const CONNECTED_USERS: &str = "connected_users";

pub fn user_key(username: &str) -> String {
    format!("users:{}", username)
}

pub fn session_key(session_id: &str) -> String {
    format!("sessions:{}", session_id)
}

pub fn user_sessions_key(username: &str) -> String {
    format!("user_sessions:{}", username)
}

pub fn connection_key(session_id: &str) -> String {
    format!("connections:{}", session_id)
}

pub fn user_topic(username: &str) -> String {
    format!("user:{}", username)
}

pub fn session_topic(session_id: &str) -> String {
    format!("session:{}", session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespaces() {
        assert_eq!(user_key("alice"), "users:alice");
        assert_eq!(session_key("abc"), "sessions:abc");
        assert_eq!(user_sessions_key("alice"), "user_sessions:alice");
        assert_eq!(connection_key("abc"), "connections:abc");
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(user_topic("alice"), "user:alice");
        assert_eq!(session_topic("abc"), "session:abc");
    }
}
