//! Versioned, ordered banner/footer pattern table.
//!
//! Rules are matched line by line, case-insensitively. Within a class the
//! first rule (in table order) that matches a line decides what happens to
//! it. The table is configuration: changing it changes canonical hashes,
//! so every run is stamped with the table's version and hash.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::model::digest::Digest256;

/// Version tag of the built-in table.
pub const DEFAULT_RULESET_VERSION: &str = "builtin-2025-06";

/// What a rule does when it matches a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternClass {
    /// Drop the matching line (external-sender warnings and the like).
    Banner,
    /// Cut the body at the matching line (legal disclaimers, footers).
    Footer,
}

/// One configurable rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub name: String,
    pub class: PatternClass,
    pub pattern: String,
}

impl PatternRule {
    fn new(name: &str, class: PatternClass, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            class,
            pattern: pattern.to_string(),
        }
    }
}

/// A compiled rule table.
#[derive(Debug, Clone)]
pub struct PatternSet {
    version: String,
    ruleset_hash: Digest256,
    banners: Vec<(String, Regex)>,
    footers: Vec<(String, Regex)>,
}

impl PatternSet {
    /// Compile a rule table. Fails on the first pattern that does not compile.
    pub fn compile(version: &str, rules: &[PatternRule]) -> Result<Self> {
        let mut banners = Vec::new();
        let mut footers = Vec::new();
        for rule in rules {
            let re = RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| EngineError::InvalidPattern {
                    name: rule.name.clone(),
                    reason: e.to_string(),
                })?;
            match rule.class {
                PatternClass::Banner => banners.push((rule.name.clone(), re)),
                PatternClass::Footer => footers.push((rule.name.clone(), re)),
            }
        }

        let payload = serde_json::to_vec(rules)?;
        let mut hasher = Sha256::new();
        hasher.update(version.as_bytes());
        hasher.update([0u8]);
        hasher.update(&payload);

        Ok(Self {
            version: version.to_string(),
            ruleset_hash: Digest256(hasher.finalize().into()),
            banners,
            footers,
        })
    }

    /// The built-in table.
    pub fn builtin() -> Result<Self> {
        Self::compile(DEFAULT_RULESET_VERSION, &default_rules())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn ruleset_hash(&self) -> Digest256 {
        self.ruleset_hash
    }

    /// Name of the first banner rule matching `line`.
    pub fn banner_match(&self, line: &str) -> Option<&str> {
        first_match(&self.banners, line)
    }

    /// Name of the first footer rule matching `line`.
    pub fn footer_match(&self, line: &str) -> Option<&str> {
        first_match(&self.footers, line)
    }
}

fn first_match<'a>(rules: &'a [(String, Regex)], line: &str) -> Option<&'a str> {
    rules
        .iter()
        .find(|(_, re)| re.is_match(line))
        .map(|(name, _)| name.as_str())
}

/// External-sender banners and disclaimer footers seen in practice.
pub fn default_rules() -> Vec<PatternRule> {
    use PatternClass::{Banner, Footer};
    vec![
        PatternRule::new(
            "external_email_dont_click",
            Banner,
            r"^\s*external\s+email\s*:\s*don'?t\s+click\s+links\s+or\s+open\s+attachments\s+unless\s+the\s+content\s+is\s+expected\s+and\s+known\s+to\s+be\s+safe\.?\s*$",
        ),
        PatternRule::new(
            "external_tag_dont_click",
            Banner,
            r"^\s*\[?\s*external\s*\]?\s*:?\s*don'?t\s+click\s+links.*$",
        ),
        PatternRule::new(
            "external_email_warning",
            Banner,
            r"^.*external\s+email\s*:.*(?:click|links?|attachments?|safe).*$",
        ),
        PatternRule::new(
            "caution_external",
            Banner,
            r"^\s*\[?\s*(?:caution|warning)[:\-]?\s*external\s+(?:email|sender).*$",
        ),
        PatternRule::new("external_sender", Banner, r"^\s*\[?\s*external sender\b.*$"),
        PatternRule::new("external_email_prefix", Banner, r"^\s*\[?external email\b.*$"),
        PatternRule::new("safety_tip", Banner, r"^\s*(?:safety|security)\s+tip[:\s-].*$"),
        PatternRule::new(
            "expected_and_safe",
            Banner,
            r"^.*expected\s+and\s+known\s+to\s+be\s+safe.*$",
        ),
        PatternRule::new(
            "originated_outside",
            Banner,
            r"^\s*this (?:e-?mail|message) originated (?:from )?outside.*$",
        ),
        PatternRule::new(
            "do_not_click",
            Banner,
            r"^\s*do(?: not|n'?t) (?:click|open) (?:links?|attachments?).*$",
        ),
        PatternRule::new(
            "unless_recognise",
            Banner,
            r"^\s*unless (?:you|the) (?:recogni[sz]e|content is expected).*$",
        ),
        PatternRule::new("disclaimer_from", Footer, r"^\s*disclaimer from:"),
        PatternRule::new(
            "confidential_email",
            Footer,
            r"^\s*this (?:e-?mail|message) (?:and any attachments )?(?:is|are) (?:strictly )?confidential",
        ),
        PatternRule::new(
            "privileged_message",
            Footer,
            r"^\s*this (?:e-?mail|message) (?:and any attachments )?(?:contains|may contain) (?:confidential|privileged)",
        ),
        PatternRule::new(
            "information_confidential",
            Footer,
            r"^\s*the information (?:contained|in) this (?:e-?mail|message).*confidential",
        ),
        PatternRule::new(
            "intended_recipient",
            Footer,
            r"^\s*if you are not the intended recipient",
        ),
        PatternRule::new(
            "received_in_error",
            Footer,
            r"^\s*if you have received this (?:e-?mail|message) in error",
        ),
        PatternRule::new("email_intended", Footer, r"^\s*this (?:e-?mail|message) is intended"),
        PatternRule::new("views_opinions", Footer, r"^\s*any views or opinions"),
        PatternRule::new("disclaimer", Footer, r"^\s*disclaimer[:\s]"),
        PatternRule::new("registered_office", Footer, r"^\s*registered (?:office|address)"),
        PatternRule::new(
            "registered_in",
            Footer,
            r"^\s*registered in (?:england|wales|scotland|ireland)",
        ),
        PatternRule::new(
            "company_registration",
            Footer,
            r"^\s*company (?:registration|reg\.? no|number)",
        ),
        PatternRule::new(
            "consider_environment",
            Footer,
            r"^\s*(?:please consider the environment|think before you print)",
        ),
        PatternRule::new(
            "virus_scanned",
            Footer,
            r"^\s*this (?:e-?mail|message) has been scanned for viruses",
        ),
        PatternRule::new("unsubscribe", Footer, r"^\s*click here to unsubscribe"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_compiles() {
        let set = PatternSet::builtin().expect("builtin table compiles");
        assert_eq!(set.version(), DEFAULT_RULESET_VERSION);
    }

    #[test]
    fn test_banner_first_match_wins() {
        let set = PatternSet::builtin().unwrap();
        let line = "EXTERNAL EMAIL: Don't click links or open attachments unless the content is expected and known to be safe.";
        assert_eq!(set.banner_match(line), Some("external_email_dont_click"));
        assert_eq!(
            set.banner_match("[CAUTION: External Email] be careful"),
            Some("caution_external")
        );
        assert_eq!(set.banner_match("Please find the valuation attached."), None);
    }

    #[test]
    fn test_footer_match() {
        let set = PatternSet::builtin().unwrap();
        assert_eq!(
            set.footer_match("If you are not the intended recipient, please delete it."),
            Some("intended_recipient")
        );
        assert_eq!(
            set.footer_match("Registered in England No. 1234567"),
            Some("registered_in")
        );
        assert_eq!(set.footer_match("The slab pour is confirmed."), None);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let rules = vec![PatternRule::new("broken", PatternClass::Banner, "(unclosed")];
        match PatternSet::compile("v1", &rules) {
            Err(EngineError::InvalidPattern { name, .. }) => assert_eq!(name, "broken"),
            other => panic!("expected InvalidPattern, got {other:?}"),
        }
    }

    #[test]
    fn test_ruleset_hash_tracks_table() {
        let a = PatternSet::compile("v1", &default_rules()).unwrap();
        let b = PatternSet::compile("v1", &default_rules()).unwrap();
        let c = PatternSet::compile("v2", &default_rules()).unwrap();
        let mut rules = default_rules();
        rules.swap(0, 1);
        let d = PatternSet::compile("v1", &rules).unwrap();
        assert_eq!(a.ruleset_hash(), b.ruleset_hash());
        assert_ne!(a.ruleset_hash(), c.ruleset_hash());
        assert_ne!(a.ruleset_hash(), d.ruleset_hash());
    }
}
