//! The boolean DSL that gates secret access.
//!
//! Conditions form a small expression tree over [`SecretContext`] fields.
//! New checks are added as enum variants so every evaluator match becomes a
//! compile-time obligation rather than an open dispatch surface.
//!
//! Evaluation is pure: no I/O, no clock, no environment. The tracing form
//! exists so friendly-mode denials can show users exactly which leaf said
//! no.

use serde::{Deserialize, Serialize};

use crate::secret::SecretContext;

/// A secret access condition.
///
/// Serialized externally tagged, so the on-disk form reads
/// `{"IsBranch":"main"}` or `{"And":[...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// All sub-conditions must hold. The empty conjunction holds.
    And(Vec<Condition>),

    /// At least one sub-condition must hold. The empty disjunction fails.
    Or(Vec<Condition>),

    /// The repository owner equals the given account name.
    IsOwner(String),

    /// The repository name equals the given name.
    IsRepo(String),

    /// The effect runs for the named branch.
    IsBranch(String),

    /// The effect runs for the named tag.
    IsTag(String),

    /// The effect runs for the repository's default branch.
    IsDefaultBranch,

    /// Always holds.
    True,

    /// Never holds.
    False,
}

impl Condition {
    /// Evaluate the condition under `ctx`.
    #[must_use]
    pub fn evaluate(&self, ctx: &SecretContext) -> bool {
        match self {
            Self::And(cs) => cs.iter().all(|c| c.evaluate(ctx)),
            Self::Or(cs) => cs.iter().any(|c| c.evaluate(ctx)),
            Self::IsOwner(name) => ctx.owner.as_deref() == Some(name.as_str()),
            Self::IsRepo(name) => ctx.repo.as_deref() == Some(name.as_str()),
            Self::IsBranch(name) => ctx.branch.as_deref() == Some(name.as_str()),
            Self::IsTag(name) => ctx.tag.as_deref() == Some(name.as_str()),
            Self::IsDefaultBranch => ctx.is_default_branch,
            Self::True => true,
            Self::False => false,
        }
    }

    /// Evaluate under `ctx`, recording each leaf verdict and aggregation
    /// decision in evaluation order.
    ///
    /// Aggregates short-circuit, so the trace only names sub-conditions
    /// that were actually consulted.
    #[must_use]
    pub fn evaluate_trace(&self, ctx: &SecretContext) -> (Vec<String>, bool) {
        let mut trace = Vec::new();
        let verdict = self.trace_into(ctx, &mut trace);
        (trace, verdict)
    }

    fn trace_into(&self, ctx: &SecretContext, trace: &mut Vec<String>) -> bool {
        match self {
            Self::And(cs) => {
                let verdict = cs.iter().all(|c| c.trace_into(ctx, trace));
                trace.push(format!(
                    "And: {}",
                    if verdict { "satisfied" } else { "denied" }
                ));
                verdict
            },
            Self::Or(cs) => {
                let verdict = cs.iter().any(|c| c.trace_into(ctx, trace));
                trace.push(format!(
                    "Or: {}",
                    if verdict { "satisfied" } else { "denied" }
                ));
                verdict
            },
            Self::IsOwner(name) => {
                let verdict = ctx.owner.as_deref() == Some(name.as_str());
                trace.push(leaf_line("IsOwner", name, ctx.owner.as_deref(), verdict));
                verdict
            },
            Self::IsRepo(name) => {
                let verdict = ctx.repo.as_deref() == Some(name.as_str());
                trace.push(leaf_line("IsRepo", name, ctx.repo.as_deref(), verdict));
                verdict
            },
            Self::IsBranch(name) => {
                let verdict = ctx.branch.as_deref() == Some(name.as_str());
                trace.push(leaf_line("IsBranch", name, ctx.branch.as_deref(), verdict));
                verdict
            },
            Self::IsTag(name) => {
                let verdict = ctx.tag.as_deref() == Some(name.as_str());
                trace.push(leaf_line("IsTag", name, ctx.tag.as_deref(), verdict));
                verdict
            },
            Self::IsDefaultBranch => {
                let verdict = ctx.is_default_branch;
                trace.push(format!(
                    "IsDefaultBranch: {}",
                    if verdict { "satisfied" } else { "denied" }
                ));
                verdict
            },
            Self::True => {
                trace.push("True: satisfied".to_string());
                true
            },
            Self::False => {
                trace.push("False: denied".to_string());
                false
            },
        }
    }
}

fn leaf_line(check: &str, wanted: &str, actual: Option<&str>, verdict: bool) -> String {
    match actual {
        Some(_) if verdict => format!("{check} {wanted:?}: satisfied"),
        Some(actual) => format!("{check} {wanted:?}: denied (context has {actual:?})"),
        None => format!("{check} {wanted:?}: denied (not set in context)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch_ctx(branch: &str) -> SecretContext {
        SecretContext {
            owner: Some("acme".to_string()),
            repo: Some("infra".to_string()),
            branch: Some(branch.to_string()),
            ..SecretContext::default()
        }
    }

    #[test]
    fn test_leaves_match_context_fields() {
        let ctx = branch_ctx("main");
        assert!(Condition::IsOwner("acme".to_string()).evaluate(&ctx));
        assert!(!Condition::IsOwner("evil".to_string()).evaluate(&ctx));
        assert!(Condition::IsRepo("infra".to_string()).evaluate(&ctx));
        assert!(Condition::IsBranch("main".to_string()).evaluate(&ctx));
        assert!(!Condition::IsBranch("feature".to_string()).evaluate(&ctx));
        assert!(!Condition::IsTag("v1.0".to_string()).evaluate(&ctx));
        assert!(!Condition::IsDefaultBranch.evaluate(&ctx));
    }

    #[test]
    fn test_empty_aggregates() {
        let ctx = SecretContext::default();
        assert!(Condition::And(vec![]).evaluate(&ctx));
        assert!(!Condition::Or(vec![]).evaluate(&ctx));
    }

    #[test]
    fn test_nested_aggregation() {
        let ctx = branch_ctx("main");
        let cond = Condition::And(vec![
            Condition::IsOwner("acme".to_string()),
            Condition::Or(vec![
                Condition::IsBranch("main".to_string()),
                Condition::IsTag("release".to_string()),
            ]),
        ]);
        assert!(cond.evaluate(&ctx));

        let denied = Condition::And(vec![
            Condition::IsOwner("acme".to_string()),
            Condition::False,
        ]);
        assert!(!denied.evaluate(&ctx));
    }

    #[test]
    fn test_trace_records_leaves_then_aggregate() {
        let ctx = branch_ctx("feature");
        let cond = Condition::And(vec![
            Condition::IsOwner("acme".to_string()),
            Condition::IsBranch("main".to_string()),
        ]);
        let (trace, verdict) = cond.evaluate_trace(&ctx);
        assert!(!verdict);
        assert_eq!(
            trace,
            vec![
                "IsOwner \"acme\": satisfied".to_string(),
                "IsBranch \"main\": denied (context has \"feature\")".to_string(),
                "And: denied".to_string(),
            ]
        );
    }

    #[test]
    fn test_trace_names_missing_context_fields() {
        let ctx = SecretContext::default();
        let (trace, verdict) = Condition::IsBranch("main".to_string()).evaluate_trace(&ctx);
        assert!(!verdict);
        assert_eq!(trace, vec!["IsBranch \"main\": denied (not set in context)"]);
    }

    #[test]
    fn test_evaluation_is_pure() {
        let ctx = branch_ctx("main");
        let cond = Condition::Or(vec![
            Condition::IsTag("v1".to_string()),
            Condition::IsBranch("main".to_string()),
        ]);
        let first = cond.evaluate_trace(&ctx);
        let second = cond.evaluate_trace(&ctx);
        assert_eq!(first, second);
    }

    #[test]
    fn test_externally_tagged_serde_form() {
        let cond: Condition = serde_json::from_str(r#"{"IsBranch":"main"}"#).unwrap();
        assert_eq!(cond, Condition::IsBranch("main".to_string()));

        let nested: Condition =
            serde_json::from_str(r#"{"And":[{"IsOwner":"acme"},"IsDefaultBranch"]}"#).unwrap();
        assert_eq!(
            nested,
            Condition::And(vec![
                Condition::IsOwner("acme".to_string()),
                Condition::IsDefaultBranch,
            ])
        );
    }
}
