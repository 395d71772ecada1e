// src/auth.rs

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;

const TOKEN_LEN: usize = 43;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Exchanges the shared admin password for short-lived bearer tokens.
pub struct SessionStore {
    password: Secret<String>,
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(password: Secret<String>, ttl: Duration) -> Self {
        Self {
            password,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// `None` when the password does not match.
    pub fn login(&self, password: &str) -> Option<Session> {
        if !constant_time_eq(password.as_bytes(), self.password.expose_secret().as_bytes()) {
            return None;
        }

        let now = Utc::now();
        let session = Session {
            token: generate_token(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        let mut sessions = self.sessions.lock();
        sessions.retain(|_, s| s.expires_at > now);
        sessions.insert(session.token.clone(), session.clone());
        Some(session)
    }

    /// Invalidates `token` immediately. Returns whether it was known.
    pub fn logout(&self, token: &str) -> bool {
        self.sessions.lock().remove(token).is_some()
    }

    /// Checks the token, evicting it if it has expired.
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, Utc::now())
    }

    fn validate_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        let mut sessions = self.sessions.lock();
        let expired = match sessions.get(token) {
            Some(session) => session.expires_at <= now,
            None => return false,
        };
        if expired {
            sessions.remove(token);
        }
        !expired
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Secret::new("admin123".to_string()), Duration::hours(24))
    }

    #[test]
    fn wrong_password_gets_no_session() {
        let store = store();
        assert!(store.login("admin").is_none());
        assert!(store.login("").is_none());
        assert_eq!(store.active_sessions(), 0);
    }

    #[test]
    fn login_issues_distinct_valid_tokens() {
        let store = store();
        let a = store.login("admin123").unwrap();
        let b = store.login("admin123").unwrap();

        assert_eq!(a.token.len(), TOKEN_LEN);
        assert_ne!(a.token, b.token);
        assert_eq!(a.expires_at - a.created_at, Duration::hours(24));
        assert!(store.validate(&a.token));
        assert!(store.validate(&b.token));
        assert!(!store.validate("forged"));
    }

    #[test]
    fn logout_invalidates_immediately() {
        let store = store();
        let session = store.login("admin123").unwrap();
        assert!(store.logout(&session.token));
        assert!(!store.validate(&session.token));
        assert!(!store.logout(&session.token));
    }

    #[test]
    fn expired_token_is_rejected_and_evicted() {
        let store = store();
        let session = store.login("admin123").unwrap();
        let later = session.expires_at + Duration::seconds(1);

        assert!(!store.validate_at(&session.token, later));
        assert_eq!(store.active_sessions(), 0);
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
