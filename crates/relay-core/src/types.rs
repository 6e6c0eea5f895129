use serde::{Deserialize, Serialize};
use std::fmt;

/// Chat-platform user identifier.
///
/// Private chats on the reference transport share the numeric space of user
/// IDs, so the same value addresses both the sender and the reply target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for UserId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| format!("invalid user id: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_display_and_parse() {
        let id = UserId(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(" 42 ".parse::<UserId>().unwrap(), id);
        assert!("alice".parse::<UserId>().is_err());
    }

    #[test]
    fn user_id_serializes_as_number() {
        let json = serde_json::to_string(&UserId(7)).unwrap();
        assert_eq!(json, "7");
    }
}
