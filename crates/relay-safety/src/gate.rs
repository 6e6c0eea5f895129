use std::fmt;

use regex::{Regex, RegexBuilder};
use relay_core::config::SafetyConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SafetyError};
use crate::patterns;

/// Severity of a checked message, ordered from harmless to destructive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Safe,
    Moderate,
    Dangerous,
    Critical,
}

impl RiskTier {
    pub fn requires_confirmation(self) -> bool {
        matches!(self, RiskTier::Dangerous | RiskTier::Critical)
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Safe => write!(f, "SAFE"),
            RiskTier::Moderate => write!(f, "MODERATE"),
            RiskTier::Dangerous => write!(f, "DANGEROUS"),
            RiskTier::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Outcome of [`SafetyGate::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub requires_confirmation: bool,
    /// Description of the matched pattern; `None` for SAFE.
    pub description: Option<String>,
    /// Text to show the user; `None` for SAFE.
    pub message: Option<String>,
}

impl RiskAssessment {
    fn safe() -> Self {
        Self {
            tier: RiskTier::Safe,
            requires_confirmation: false,
            description: None,
            message: None,
        }
    }
}

struct Rule {
    regex: Regex,
    description: &'static str,
}

/// Pure classifier over the compiled pattern catalogue.
///
/// Compiled once at startup and shared read-only between dispatches.
pub struct SafetyGate {
    critical: Vec<Rule>,
    dangerous: Vec<Rule>,
    moderate: Vec<Rule>,
    /// Stored upper-cased.
    critical_phrases: Vec<String>,
    /// Stored lower-cased.
    affirmatives: Vec<String>,
    /// Stored lower-cased.
    negatives: Vec<String>,
}

impl SafetyGate {
    pub fn new(config: &SafetyConfig) -> Result<Self> {
        if config.critical_phrases.is_empty() {
            return Err(SafetyError::NoPhrase);
        }
        Ok(Self {
            critical: compile(patterns::CRITICAL)?,
            dangerous: compile(patterns::DANGEROUS)?,
            moderate: compile(patterns::MODERATE)?,
            critical_phrases: config
                .critical_phrases
                .iter()
                .map(|p| p.trim().to_uppercase())
                .collect(),
            affirmatives: config
                .affirmatives
                .iter()
                .map(|p| p.trim().to_lowercase())
                .collect(),
            negatives: config
                .negatives
                .iter()
                .map(|p| p.trim().to_lowercase())
                .collect(),
        })
    }

    /// Classify `text`.  First match in tier order wins.
    pub fn check(&self, text: &str) -> RiskAssessment {
        if let Some(rule) = first_match(&self.critical, text) {
            return RiskAssessment {
                tier: RiskTier::Critical,
                requires_confirmation: true,
                description: Some(rule.description.to_string()),
                message: Some(self.critical_message(rule.description)),
            };
        }

        if let Some(rule) = first_match(&self.dangerous, text) {
            return RiskAssessment {
                tier: RiskTier::Dangerous,
                requires_confirmation: true,
                description: Some(rule.description.to_string()),
                message: Some(dangerous_message(rule.description)),
            };
        }

        let lower = text.to_lowercase();
        if let Some(rule) = first_match(&self.moderate, &lower) {
            return RiskAssessment {
                tier: RiskTier::Moderate,
                requires_confirmation: false,
                description: Some(rule.description.to_string()),
                message: Some(format!("INFO: {} - executing...", rule.description)),
            };
        }

        RiskAssessment::safe()
    }

    /// Does `reply` confirm a pending operation of `tier`?
    ///
    /// CRITICAL needs one of the full phrases; DANGEROUS accepts the short
    /// affirmatives.  Lower tiers never need confirming and always return
    /// `false`.
    pub fn is_confirmation_valid(&self, reply: &str, tier: RiskTier) -> bool {
        match tier {
            RiskTier::Critical => {
                let upper = reply.trim().to_uppercase();
                self.critical_phrases.iter().any(|p| *p == upper)
            }
            RiskTier::Dangerous => {
                let lower = reply.trim().to_lowercase();
                self.affirmatives.iter().any(|p| *p == lower)
            }
            RiskTier::Safe | RiskTier::Moderate => false,
        }
    }

    /// Does `reply` cancel whatever is pending, regardless of tier?
    pub fn is_cancellation(&self, reply: &str) -> bool {
        let lower = reply.trim().to_lowercase();
        self.negatives.iter().any(|p| *p == lower)
    }

    /// Primary phrase quoted back in re-prompts.
    pub fn confirmation_phrase(&self) -> &str {
        &self.critical_phrases[0]
    }

    /// Re-prompt shown when a pending confirmation receives an unrelated reply.
    pub fn reprompt(&self, tier: RiskTier) -> String {
        match tier {
            RiskTier::Critical => format!(
                "Invalid confirmation. Please send exactly:\n`{}`\n\nOr `NO` to cancel.",
                self.confirmation_phrase()
            ),
            _ => "Invalid response. Send `YES` to confirm or `NO` to cancel.".to_string(),
        }
    }

    fn critical_message(&self, description: &str) -> String {
        let mut msg = format!(
            "CRITICAL OPERATION\n\nDetected: {description}\n\n\
             This operation may lead to **irreversible data loss**\nor **system failure**.\n\n\
             To confirm, send:\n`{}`",
            self.critical_phrases[0]
        );
        for alt in self.critical_phrases.iter().skip(1) {
            msg.push_str(&format!("\n\nOr:\n`{alt}`"));
        }
        msg
    }
}

fn dangerous_message(description: &str) -> String {
    format!(
        "DANGEROUS OPERATION\n\nDetected: {description}\n\n\
         Are you sure you want to continue?\n\n\
         Send `YES` to confirm or `NO` to cancel."
    )
}

fn compile(table: &[(&str, &'static str)]) -> Result<Vec<Rule>> {
    table
        .iter()
        .map(|(pattern, description)| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(|regex| Rule { regex, description })
                .map_err(|source| SafetyError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })
        })
        .collect()
}

fn first_match<'a>(rules: &'a [Rule], text: &str) -> Option<&'a Rule> {
    rules.iter().find(|rule| rule.regex.is_match(text))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
