//! Access control: an ordered rule list with wildcard matching and
//! conditions (spec §4.1 data model `ACLRule`, §4.7 step 5, §6 rule shape).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use apcore_errors::ApcoreError;

use crate::context::Identity;

/// Allow or deny, as produced by the first matching rule (or the default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// Extra predicates a rule may require in addition to caller/target glob
/// matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_call_depth: Option<usize>,
}

/// One ACL rule: caller/target glob lists, an effect, and optional
/// conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRule {
    pub callers: Vec<String>,
    pub targets: Vec<String>,
    pub effect: Effect,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: Option<Conditions>,
}

/// Context an ACL decision is made against.
pub struct AclRequest<'a> {
    pub caller: &'a str,
    pub target: &'a str,
    pub identity: Option<&'a Identity>,
    pub call_depth: usize,
}

/// An ordered list of [`AclRule`]s plus a default effect applied when none
/// match.
pub struct Acl {
    rules: Vec<AclRule>,
    default_effect: Effect,
}

impl Acl {
    #[must_use]
    pub fn new(rules: Vec<AclRule>, default_effect: Effect) -> Self {
        Self {
            rules,
            default_effect,
        }
    }

    /// Scans rules in order; the first whose caller glob, target glob, and
    /// conditions all match decides. No match falls back to the default
    /// effect.
    ///
    /// # Errors
    /// Returns `ApcoreError::ACLDenied` when the decision is `Deny`.
    pub fn check(&self, request: &AclRequest<'_>) -> Result<(), ApcoreError> {
        let effect = self
            .rules
            .iter()
            .find(|rule| rule_matches(rule, request))
            .map_or(self.default_effect, |rule| rule.effect);

        match effect {
            Effect::Allow => Ok(()),
            Effect::Deny => Err(ApcoreError::acl_denied(request.caller, request.target)),
        }
    }
}

fn rule_matches(rule: &AclRule, request: &AclRequest<'_>) -> bool {
    let caller_matches = rule.callers.iter().any(|p| glob_match(p, request.caller));
    let target_matches = rule.targets.iter().any(|p| glob_match(p, request.target));
    if !caller_matches || !target_matches {
        return false;
    }
    match &rule.conditions {
        None => true,
        Some(conditions) => conditions_match(conditions, request),
    }
}

fn conditions_match(conditions: &Conditions, request: &AclRequest<'_>) -> bool {
    if let Some(types) = &conditions.identity_types {
        let Some(identity) = request.identity else {
            return false;
        };
        if !types.iter().any(|t| t == &identity.identity_type) {
            return false;
        }
    }
    if let Some(roles) = &conditions.roles {
        let Some(identity) = request.identity else {
            return false;
        };
        let identity_roles: BTreeSet<&str> = identity.roles.iter().map(String::as_str).collect();
        if !roles.iter().any(|r| identity_roles.contains(r.as_str())) {
            return false;
        }
    }
    if let Some(max_depth) = conditions.max_call_depth {
        if request.call_depth > max_depth {
            return false;
        }
    }
    true
}

/// Matches `text` against a glob `pattern` where `*` matches any sequence
/// (including empty) and `?` matches exactly one character.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_chars(&pattern, &text)
}

fn glob_match_chars(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star_p, mut star_t) = (None, 0usize);

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star_p = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star_p {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
