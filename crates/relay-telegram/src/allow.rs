//! Allowlist enforcement.
//!
//! Deny-by-default: an empty `allow_users` list means no one is allowed.
//! Wildcard `"*"` allows everyone. Username entries may include the leading `@`.

use relay_core::UserId;

/// Returns `true` when the sender may talk to the bot.
///
/// Entries match the numeric user ID or the username (case-sensitive, as
/// the Bot API reports it). Users without a username can only be admitted
/// by ID or wildcard.
pub fn is_allowed(allow_users: &[String], username: Option<&str>, user: UserId) -> bool {
    let id = user.to_string();
    allow_users.iter().any(|entry| {
        let entry = entry.trim().trim_start_matches('@');
        entry == "*" || entry == id || username.is_some_and(|name| !name.is_empty() && entry == name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn empty_list_denies_everyone() {
        assert!(!is_allowed(&[], Some("alice"), UserId(1)));
        assert!(!is_allowed(&[], None, UserId(1)));
    }

    #[test]
    fn wildcard_admits_users_without_username() {
        assert!(is_allowed(&list(&["*"]), None, UserId(99)));
    }

    #[test]
    fn matches_id_or_username() {
        let allow = list(&["@alice", "123456789"]);
        assert!(is_allowed(&allow, Some("alice"), UserId(5)));
        assert!(is_allowed(&allow, None, UserId(123456789)));
        assert!(!is_allowed(&allow, Some("bob"), UserId(6)));
        assert!(!is_allowed(&allow, Some("Alice"), UserId(6)));
    }

    #[test]
    fn blank_entries_never_match_missing_usernames() {
        let allow = list(&["", "@"]);
        assert!(!is_allowed(&allow, None, UserId(7)));
        assert!(!is_allowed(&allow, Some(""), UserId(7)));
    }
}
