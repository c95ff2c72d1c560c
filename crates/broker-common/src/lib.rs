//! Shared error type and wire-level data types for the challenge-instance broker.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("unknown challenge: {0}")]
    UnknownChallenge(String),

    #[error("user already assigned: {0}")]
    AlreadyAssigned(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("build failed for {challenge}: {source}")]
    BuildError { challenge: String, source: String },

    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("no port available after exhausting collision budget")]
    NoPortAvailable,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// A challenge template: image, port, per-instance limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub name: String,
    pub internal_port: u16,
    pub mem_limit_mb: u32,
    pub user_limit: u32,
    pub lifetime_seconds: u64,
    pub can_prestart: bool,
}

/// A running container dedicated to one challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub container_id: String,
    pub challenge: String,
    pub external_port: u16,
    pub started_at: u64,
    pub users: Vec<String>,
    pub user_limit: u32,
}

impl Instance {
    pub fn has_free_seats(&self, margin: usize) -> bool {
        self.users.len() + margin <= self.user_limit as usize
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.users.len() >= self.user_limit as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_seats_margin() {
        let inst = Instance {
            container_id: "c1".into(),
            challenge: "echo".into(),
            external_port: 9001,
            started_at: 0,
            users: vec!["a".into(), "b".into(), "c".into()],
            user_limit: 4,
        };
        // 3 users, limit 4: 3 + 2 > 4, so NOT free with a 2-seat margin.
        assert!(!inst.has_free_seats(2));
        assert!(inst.has_free_seats(1));
        assert!(!inst.is_full());
    }

    #[test]
    fn serde_round_trip() {
        let inst = Instance {
            container_id: "c1".into(),
            challenge: "echo".into(),
            external_port: 9001,
            started_at: 100,
            users: vec!["a".into()],
            user_limit: 4,
        };
        let json = serde_json::to_string(&inst).unwrap();
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(inst, back);
    }
}
