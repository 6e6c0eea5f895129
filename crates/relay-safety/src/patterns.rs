//! Pattern catalogue for the three risk tiers.
//!
//! Every entry is `(regex, human_readable_description)`.  Tiers are checked
//! in the order CRITICAL → DANGEROUS → MODERATE and the first match wins, so
//! a more specific CRITICAL rule (`rm -rf /`) shadows the broader DANGEROUS
//! one (`rm -rf`).
//!
//! Several DANGEROUS entries are loose substrings (`shutdown`, `reboot`,
//! `TRUNCATE`).  They match anywhere in the message, including prose such
//! as "why did the server reboot?".  Keep it that way: narrowing them changes
//! which messages need confirmation.

// ---------------------------------------------------------------------------
// CRITICAL: irreversible loss of data or of the machine
// ---------------------------------------------------------------------------

/// Matched case-insensitively against the raw message.
pub const CRITICAL: &[(&str, &str)] = &[
    (r"rm\s+-rf\s+/\s*$", "Deleting root filesystem"),
    (r"rm\s+-rf\s+/\*", "Deleting all root contents"),
    (r"rm\s+-rf\s+~", "Deleting home directory"),
    (r"mkfs\.", "Formatting filesystem"),
    (r"dd\s+if=.+of=/dev/[a-z]+\s*$", "Writing to block device"),
    (r"dd\s+if=.+of=/dev/sd[a-z]", "Writing to disk device"),
    (r">\s*/dev/sd[a-z]", "Overwriting block device"),
    (r":\(\)\{\s*:\|:&\s*\};:", "Fork bomb"),
    (r"DROP\s+DATABASE", "Dropping database"),
];

// ---------------------------------------------------------------------------
// DANGEROUS: disruptive but recoverable
// ---------------------------------------------------------------------------

/// Matched case-insensitively against the raw message.
pub const DANGEROUS: &[(&str, &str)] = &[
    (r"rm\s+-rf", "Recursive file deletion"),
    (r"chmod\s+-R\s+777", "Opening all permissions recursively"),
    (r"chmod\s+777\s+/", "Opening permissions on system directories"),
    (r"shutdown", "System shutdown"),
    (r"reboot", "System reboot"),
    (r"init\s+[06]", "Changing runlevel"),
    (
        r"systemctl\s+(stop|disable)\s+(ssh|sshd|network)",
        "Stopping critical services",
    ),
    (r"iptables\s+-F", "Flushing firewall rules"),
    (r"passwd\s+root", "Changing root password"),
    (r"userdel", "Deleting user"),
    (r"DROP\s+TABLE", "Dropping table"),
    (r"TRUNCATE", "Truncating table"),
    (r"chown\s+-R\s+root", "Recursive ownership change to root"),
    (r"curl\s+.+\|\s*(ba)?sh", "Pipe from URL to shell"),
    (r"wget\s+.+\|\s*(ba)?sh", "Pipe from URL to shell"),
];

// ---------------------------------------------------------------------------
// MODERATE: informational only, never blocks
// ---------------------------------------------------------------------------

/// Matched against the lower-cased message.
pub const MODERATE: &[(&str, &str)] = &[
    (r"apt\s+(remove|purge)", "Removing packages"),
    (r"pip\s+uninstall", "Removing Python packages"),
    (r"npm\s+uninstall\s+-g", "Removing global npm packages"),
    (r"docker\s+(rm|rmi|system\s+prune)", "Removing Docker resources"),
    (r"git\s+push\s+.*--force", "Force push to git"),
    (r"git\s+reset\s+--hard", "Hard reset in git"),
];
