//! Secret records and the access context they are checked against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// A single named secret as stored in the agent's secrets file.
///
/// The `data` object is the material handed to the consumer; `condition`
/// governs access and is stripped before anything reaches disk inside a
/// sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Key-value material returned to the consumer.
    pub data: BTreeMap<String, serde_json::Value>,

    /// Access condition. Always serialized (as `null` when absent) so the
    /// provisioned form is visibly condition-free.
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl Secret {
    /// A secret carrying only data, with no access condition.
    #[must_use]
    pub fn unconditional(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            data,
            condition: None,
        }
    }
}

/// The context a secret access is evaluated under.
///
/// All fields are optional because local `friendly` invocations may run
/// outside any repository or project; the condition evaluator treats an
/// absent field as failing the corresponding check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretContext {
    /// Project identifier assigned by the API.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Account owning the repository.
    #[serde(default)]
    pub owner: Option<String>,

    /// Repository name.
    #[serde(default)]
    pub repo: Option<String>,

    /// Branch name, when the effect runs for a branch ref.
    #[serde(default)]
    pub branch: Option<String>,

    /// Tag name, when the effect runs for a tag ref.
    #[serde(default)]
    pub tag: Option<String>,

    /// Whether the ref is the repository's default branch.
    #[serde(default)]
    pub is_default_branch: bool,
}
