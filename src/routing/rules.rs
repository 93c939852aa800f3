//! Routing rules and complexity scoring.
//!
//! Rules are evaluated in table order; the first whose pattern matches the
//! task type decides the score and the backends. Unmatched tasks get the
//! default complexity. Large payloads add a fixed boost.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::router_types::TaskRequest;
use crate::agents::AgentId;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Rule {rule}: invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("Rule {rule}: complexity {value} outside [0, 1]")]
    ComplexityOutOfRange { rule: String, value: f64 },
}

/// Rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRuleConfig {
    pub name: String,
    /// Regular expression matched against the task type.
    pub pattern: String,
    pub complexity: f64,
    #[serde(default)]
    pub preferred_backend: Option<String>,
    #[serde(default)]
    pub failover_backend: Option<String>,
    /// Agent that must be running before the task is dispatched.
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pattern: Regex,
    pub complexity: f64,
    pub preferred_backend: Option<String>,
    pub failover_backend: Option<String>,
    pub agent: Option<AgentId>,
}

impl RoutingRule {
    pub fn compile(config: &RoutingRuleConfig) -> Result<Self, RuleError> {
        if !(0.0..=1.0).contains(&config.complexity) {
            return Err(RuleError::ComplexityOutOfRange {
                rule: config.name.clone(),
                value: config.complexity,
            });
        }
        let pattern = Regex::new(&config.pattern).map_err(|source| RuleError::InvalidPattern {
            rule: config.name.clone(),
            source,
        })?;
        Ok(Self {
            name: config.name.clone(),
            pattern,
            complexity: config.complexity,
            preferred_backend: config.preferred_backend.clone(),
            failover_backend: config.failover_backend.clone(),
            agent: config.agent.as_deref().map(AgentId::from),
        })
    }

    pub fn matches(&self, task_type: &str) -> bool {
        self.pattern.is_match(task_type)
    }
}

/// Payload-size heuristic.
#[derive(Debug, Clone)]
pub struct PayloadBoost {
    pub threshold_bytes: u64,
    pub boost: f64,
}

impl Default for PayloadBoost {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024 * 1024,
            boost: 0.2,
        }
    }
}

/// Score and matched rule for one task.
#[derive(Debug, Clone, Copy)]
pub struct Classification<'a> {
    pub rule: Option<&'a RoutingRule>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
    default_complexity: f64,
    payload: PayloadBoost,
}

impl RuleSet {
    pub fn compile(
        rules: &[RoutingRuleConfig],
        default_complexity: f64,
        payload: PayloadBoost,
    ) -> Result<Self, RuleError> {
        let rules = rules
            .iter()
            .map(RoutingRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            default_complexity: default_complexity.clamp(0.0, 1.0),
            payload,
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn classify(&self, task: &TaskRequest) -> Classification<'_> {
        let rule = self.rules.iter().find(|r| r.matches(&task.task_type));
        let mut score = rule.map(|r| r.complexity).unwrap_or(self.default_complexity);
        if task
            .payload_bytes
            .is_some_and(|b| b >= self.payload.threshold_bytes)
        {
            score += self.payload.boost;
        }
        Classification {
            rule,
            score: score.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, pattern: &str, complexity: f64) -> RoutingRuleConfig {
        RoutingRuleConfig {
            name: name.into(),
            pattern: pattern.into(),
            complexity,
            preferred_backend: None,
            failover_backend: None,
            agent: None,
        }
    }

    fn rules() -> RuleSet {
        RuleSet::compile(
            &[
                rule("reasoning", "^(reason|plan)", 0.9),
                rule("vision", "^vision\\.", 0.6),
                rule("catch-vision", "vision", 0.1),
            ],
            0.3,
            PayloadBoost::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let set = rules();
        let c = set.classify(&TaskRequest::new("t", "vision.caption", 1000));
        assert_eq!(c.rule.unwrap().name, "vision");
        assert!((c.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_unmatched_uses_default() {
        let set = rules();
        let c = set.classify(&TaskRequest::new("t", "smalltalk", 1000));
        assert!(c.rule.is_none());
        assert!((c.score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_large_payload_boosts_and_clamps() {
        let set = rules();
        let big = TaskRequest::new("t", "vision.ocr", 1000).with_payload_bytes(4 * 1024 * 1024);
        assert!((set.classify(&big).score - 0.8).abs() < 1e-9);

        let huge_reasoning = TaskRequest::new("t", "reason", 1000).with_payload_bytes(u64::MAX);
        assert_eq!(set.classify(&huge_reasoning).score, 1.0);
    }

    #[test]
    fn test_bad_rules_rejected() {
        assert!(matches!(
            RoutingRule::compile(&rule("bad", "(", 0.5)),
            Err(RuleError::InvalidPattern { .. })
        ));
        assert!(matches!(
            RoutingRule::compile(&rule("bad", "x", 1.5)),
            Err(RuleError::ComplexityOutOfRange { .. })
        ));
    }
}
