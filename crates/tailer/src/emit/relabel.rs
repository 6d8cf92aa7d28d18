//! Relabel — rewrites or drops entries based on their label set.
//!
//! The tailer only depends on the [`RelabelPipeline`] contract. [`RuleSet`]
//! is a small built-in engine covering the usual actions with fully
//! anchored patterns.

use grep_matcher::{Captures, Matcher};
use grep_regex::{RegexMatcher, RegexMatcherBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::entry::LabelSet;

#[derive(Error, Debug)]
pub enum RelabelError {
    #[error("Invalid regex pattern '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("Relabel rule {0}: action 'replace' requires target_label")]
    MissingTargetLabel(usize),
}

/// Returns the rewritten labels, or `None` to drop the entry.
pub trait RelabelPipeline: Send + Sync {
    fn process(&self, labels: LabelSet) -> Option<LabelSet>;
}

/// Pass-through pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelabel;

impl RelabelPipeline for NoRelabel {
    fn process(&self, labels: LabelSet) -> Option<LabelSet> {
        Some(labels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    #[default]
    Replace,
    Keep,
    Drop,
    LabelDrop,
    LabelKeep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelabelRuleConfig {
    pub source_labels: Vec<String>,
    pub separator: String,
    pub regex: String,
    pub action: RelabelAction,
    pub target_label: Option<String>,
    pub replacement: String,
}

impl Default for RelabelRuleConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: ";".to_string(),
            regex: "(.*)".to_string(),
            action: RelabelAction::Replace,
            target_label: None,
            replacement: "$1".to_string(),
        }
    }
}

struct RelabelRule {
    action: RelabelAction,
    source_labels: Vec<String>,
    separator: String,
    matcher: RegexMatcher,
    target_label: Option<String>,
    replacement: String,
}

impl RelabelRule {
    fn compile(index: usize, config: &RelabelRuleConfig) -> Result<Self, RelabelError> {
        if config.action == RelabelAction::Replace && config.target_label.is_none() {
            return Err(RelabelError::MissingTargetLabel(index));
        }

        let anchored = format!("^(?:{})$", config.regex);
        let matcher = RegexMatcherBuilder::new()
            .multi_line(false)
            .build(&anchored)
            .map_err(|e| RelabelError::InvalidRegex {
                pattern: config.regex.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            action: config.action,
            source_labels: config.source_labels.clone(),
            separator: config.separator.clone(),
            matcher,
            target_label: config.target_label.clone(),
            replacement: config.replacement.clone(),
        })
    }

    fn apply(&self, mut labels: LabelSet) -> Option<LabelSet> {
        match self.action {
            RelabelAction::Keep => self.is_match(&self.source_value(&labels)).then_some(labels),
            RelabelAction::Drop => (!self.is_match(&self.source_value(&labels))).then_some(labels),
            RelabelAction::Replace => {
                let source = self.source_value(&labels);
                if let (Some(target), Some(value)) = (&self.target_label, self.replace(&source)) {
                    if value.is_empty() {
                        labels.remove(target);
                    } else {
                        labels.insert(target.as_str(), value);
                    }
                }
                Some(labels)
            }
            RelabelAction::LabelDrop => {
                labels.retain(|name, _| !self.is_match(name));
                Some(labels)
            }
            RelabelAction::LabelKeep => {
                labels.retain(|name, _| self.is_match(name));
                Some(labels)
            }
        }
    }

    fn source_value(&self, labels: &LabelSet) -> String {
        self.source_labels
            .iter()
            .map(|name| labels.get(name).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(&self.separator)
    }

    fn is_match(&self, value: &str) -> bool {
        self.matcher.is_match(value.as_bytes()).unwrap_or(false)
    }

    /// Expand `replacement` (`$1`, `${name}`) against `value`, if it matches.
    fn replace(&self, value: &str) -> Option<String> {
        let mut caps = self.matcher.new_captures().ok()?;
        if !self
            .matcher
            .captures(value.as_bytes(), &mut caps)
            .unwrap_or(false)
        {
            return None;
        }
        let mut dst = Vec::new();
        caps.interpolate(
            |name| self.matcher.capture_index(name),
            value.as_bytes(),
            self.replacement.as_bytes(),
            &mut dst,
        );
        Some(String::from_utf8_lossy(&dst).into_owned())
    }
}

/// Ordered list of compiled rules. An entry is dropped as soon as one
/// rule drops it.
pub struct RuleSet {
    rules: Vec<RelabelRule>,
}

impl RuleSet {
    pub fn compile(configs: &[RelabelRuleConfig]) -> Result<Self, RelabelError> {
        let rules = configs
            .iter()
            .enumerate()
            .map(|(i, c)| RelabelRule::compile(i, c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl RelabelPipeline for RuleSet {
    fn process(&self, labels: LabelSet) -> Option<LabelSet> {
        self.rules.iter().try_fold(labels, |labels, rule| rule.apply(labels))
    }
}
