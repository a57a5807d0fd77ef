//! Ordered security rules.
//!
//! Rules are evaluated in declared order and the first match wins. A rule
//! matches when its operation kind equals the request's and every pattern it
//! declares matches the corresponding request field. Patterns are regular
//! expressions anchored at the start of the field. A declared pattern against
//! a field the request does not carry is treated as a wildcard.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::operation::{Operation, OperationKind};
use crate::types::{Error, Result};

/// Rule outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Denied,
    RequireApproval,
    Allowed,
}

/// A declarative security rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SecurityRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub operation: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pattern: Option<String>,
    pub decision: Decision,
}

impl SecurityRule {
    pub fn new(name: impl Into<String>, operation: OperationKind, decision: Decision) -> Self {
        Self {
            name: name.into(),
            description: None,
            operation,
            server_pattern: None,
            tool_pattern: None,
            resource_pattern: None,
            decision,
        }
    }

    pub fn with_server_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.server_pattern = Some(pattern.into());
        self
    }

    pub fn with_tool_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.tool_pattern = Some(pattern.into());
        self
    }

    pub fn with_resource_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.resource_pattern = Some(pattern.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check that the rule is named and every declared pattern compiles.
    pub fn validate(&self) -> Result<()> {
        self.compile().map(|_| ())
    }

    fn compile(&self) -> Result<CompiledRule> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("security rule name cannot be empty"));
        }
        Ok(CompiledRule {
            server: compile_pattern(&self.name, self.server_pattern.as_deref())?,
            tool: compile_pattern(&self.name, self.tool_pattern.as_deref())?,
            resource: compile_pattern(&self.name, self.resource_pattern.as_deref())?,
            rule: self.clone(),
        })
    }
}

fn compile_pattern(rule: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(&format!("^(?:{})", p)).map_err(|e| {
                Error::configuration(format!("rule '{}': invalid pattern '{}': {}", rule, p, e))
            })
        })
        .transpose()
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: SecurityRule,
    server: Option<Regex>,
    tool: Option<Regex>,
    resource: Option<Regex>,
}

impl CompiledRule {
    fn matches(
        &self,
        kind: OperationKind,
        server: &str,
        tool: Option<&str>,
        resource: Option<&str>,
    ) -> bool {
        if self.rule.operation != kind {
            return false;
        }
        field_matches(self.server.as_ref(), Some(server))
            && field_matches(self.tool.as_ref(), tool)
            && field_matches(self.resource.as_ref(), resource)
    }
}

fn field_matches(pattern: Option<&Regex>, value: Option<&str>) -> bool {
    match (pattern, value) {
        (Some(re), Some(v)) => re.is_match(v),
        _ => true,
    }
}

/// Immutable, compiled rule list plus the fallback decision.
///
/// Evaluation takes `&self` and never mutates, so a shared engine can be used
/// from any number of tasks.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    default_decision: Decision,
}

impl RuleEngine {
    pub fn new(rules: &[SecurityRule], default_decision: Decision) -> Result<Self> {
        let rules = rules
            .iter()
            .map(SecurityRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            default_decision,
        })
    }

    /// Decide an operation described field by field.
    pub fn evaluate(
        &self,
        kind: OperationKind,
        server: &str,
        tool: Option<&str>,
        resource: Option<&str>,
    ) -> Decision {
        match self.first_match(kind, server, tool, resource) {
            Some(rule) => {
                tracing::debug!(rule = %rule.name, kind = %kind, server, "security rule matched");
                rule.decision
            }
            None => self.default_decision,
        }
    }

    /// First rule matching the operation, if any.
    pub fn matching_rule(&self, operation: &Operation) -> Option<&SecurityRule> {
        self.first_match(
            operation.kind,
            &operation.server,
            operation.tool.as_deref(),
            operation.resource.as_deref(),
        )
    }

    pub fn evaluate_operation(&self, operation: &Operation) -> Decision {
        self.evaluate(
            operation.kind,
            &operation.server,
            operation.tool.as_deref(),
            operation.resource.as_deref(),
        )
    }

    fn first_match(
        &self,
        kind: OperationKind,
        server: &str,
        tool: Option<&str>,
        resource: Option<&str>,
    ) -> Option<&SecurityRule> {
        self.rules
            .iter()
            .find(|r| r.matches(kind, server, tool, resource))
            .map(|r| &r.rule)
    }

    /// Append a rule, replacing any existing rule with the same name in place.
    pub fn add_rule(&mut self, rule: SecurityRule) -> Result<()> {
        let compiled = rule.compile()?;
        match self.rules.iter_mut().find(|r| r.rule.name == rule.name) {
            Some(existing) => *existing = compiled,
            None => self.rules.push(compiled),
        }
        Ok(())
    }

    /// Remove a rule by name. Returns whether it existed.
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.rule.name != name);
        self.rules.len() != before
    }

    pub fn rules(&self) -> impl Iterator<Item = &SecurityRule> {
        self.rules.iter().map(|r| &r.rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn default_decision(&self) -> Decision {
        self.default_decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn engine(rules: Vec<SecurityRule>) -> RuleEngine {
        RuleEngine::new(&rules, Decision::RequireApproval).unwrap()
    }

    #[test]
    fn test_no_rules_falls_back_to_default() {
        let engine = engine(vec![]);
        assert_eq!(
            engine.evaluate(OperationKind::ToolCall, "fs", Some("read"), None),
            Decision::RequireApproval
        );
    }

    #[test]
    fn test_safe_prefix_pattern() {
        let engine = engine(vec![SecurityRule::new(
            "safe",
            OperationKind::ToolCall,
            Decision::Allowed,
        )
        .with_tool_pattern("safe-.*")]);

        assert_eq!(
            engine.evaluate(OperationKind::ToolCall, "math", Some("safe-add"), None),
            Decision::Allowed
        );
        assert_eq!(
            engine.evaluate(OperationKind::ToolCall, "math", Some("danger-delete"), None),
            Decision::RequireApproval
        );
    }

    #[test]
    fn test_patterns_are_anchored_at_start() {
        let engine = engine(vec![SecurityRule::new(
            "reads",
            OperationKind::ToolCall,
            Decision::Allowed,
        )
        .with_tool_pattern("read")]);

        assert_eq!(
            engine.evaluate(OperationKind::ToolCall, "fs", Some("read_file"), None),
            Decision::Allowed
        );
        assert_eq!(
            engine.evaluate(OperationKind::ToolCall, "fs", Some("unread"), None),
            Decision::RequireApproval
        );
    }

    #[test]
    fn test_operation_kind_must_match() {
        let engine = engine(vec![SecurityRule::new(
            "deny-reads",
            OperationKind::ResourceRead,
            Decision::Denied,
        )]);
        assert_eq!(
            engine.evaluate(OperationKind::ToolCall, "fs", Some("read"), None),
            Decision::RequireApproval
        );
        assert_eq!(
            engine.evaluate(OperationKind::ResourceRead, "fs", None, Some("file:///etc")),
            Decision::Denied
        );
    }

    #[test]
    fn test_pattern_against_absent_field_is_wildcard() {
        let engine = engine(vec![SecurityRule::new(
            "starts",
            OperationKind::ServerStart,
            Decision::Allowed,
        )
        .with_tool_pattern("never")]);
        assert_eq!(
            engine.evaluate(OperationKind::ServerStart, "fs", None, None),
            Decision::Allowed
        );
    }

    #[test]
    fn test_first_match_beats_more_specific_later_rule() {
        let engine = engine(vec![
            SecurityRule::new("broad", OperationKind::ToolCall, Decision::Denied),
            SecurityRule::new("specific", OperationKind::ToolCall, Decision::Allowed)
                .with_server_pattern("fs")
                .with_tool_pattern("read"),
        ]);
        assert_eq!(
            engine.evaluate(OperationKind::ToolCall, "fs", Some("read"), None),
            Decision::Denied
        );
    }

    #[test]
    fn test_add_and_remove_rule() {
        let mut engine = engine(vec![]);
        engine
            .add_rule(
                SecurityRule::new("block-exec", OperationKind::ToolCall, Decision::Denied)
                    .with_tool_pattern("exec"),
            )
            .unwrap();
        assert_eq!(engine.len(), 1);
        assert_eq!(
            engine.evaluate(OperationKind::ToolCall, "sh", Some("exec"), None),
            Decision::Denied
        );

        assert!(engine.remove_rule("block-exec"));
        assert!(!engine.remove_rule("block-exec"));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = RuleEngine::new(
            &[SecurityRule::new("bad", OperationKind::ToolCall, Decision::Denied)
                .with_tool_pattern("[unclosed")],
            Decision::Allowed,
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    fn decision_strategy() -> impl Strategy<Value = Decision> {
        prop_oneof![
            Just(Decision::Denied),
            Just(Decision::RequireApproval),
            Just(Decision::Allowed),
        ]
    }

    proptest! {
        #[test]
        fn prop_first_matching_rule_wins(
            decisions in proptest::collection::vec(
                (decision_strategy(), proptest::bool::ANY),
                1..8,
            ),
        ) {
            // Each rule either matches tool "t" (no pattern) or never matches ("x").
            let rules: Vec<SecurityRule> = decisions
                .iter()
                .enumerate()
                .map(|(i, (decision, matching))| {
                    let rule = SecurityRule::new(format!("r{}", i), OperationKind::ToolCall, *decision);
                    if *matching { rule } else { rule.with_tool_pattern("x") }
                })
                .collect();
            let engine = RuleEngine::new(&rules, Decision::RequireApproval).unwrap();

            let expected = decisions
                .iter()
                .find(|(_, matching)| *matching)
                .map(|(d, _)| *d)
                .unwrap_or(Decision::RequireApproval);
            prop_assert_eq!(
                engine.evaluate(OperationKind::ToolCall, "s", Some("t"), None),
                expected
            );
        }
    }
}
