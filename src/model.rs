//! Persisted records: functions and per-project service configs.
//!
//! The status triple (`BuildStatus`, `DeployStatus`, last `Action`) is the
//! whole lifecycle state of a function; every mutation goes through the
//! lifecycle service so the fail-reason fields stay paired with their
//! Failed statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Language of the submitted source code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Nodejs,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Nodejs => write!(f, "nodejs"),
        }
    }
}

/// Build half of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    NotBuilt,
    Building,
    Success,
    Failed,
}

/// Deploy half of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployStatus {
    NotDeployed,
    Deploying,
    Deployed,
    DeploymentFailed,
    RedeployRequired,
}

/// The last lifecycle action applied to a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Create,
    Build,
    Deploy,
    Update,
}

/// A user function: source code plus its build/deploy lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: Uuid,

    /// Owner and project the function belongs to (the pair resolves to a
    /// [`ProjectConfig`]).
    pub owner: String,
    #[serde(rename = "projectId")]
    pub project_id: String,

    pub code: String,
    pub language: Language,

    #[serde(rename = "buildStatus")]
    pub build_status: BuildStatus,
    /// Meaningful only while `build_status == Failed`; empty otherwise.
    #[serde(rename = "buildFailReason")]
    pub build_fail_reason: String,

    #[serde(rename = "deployStatus")]
    pub deploy_status: DeployStatus,
    /// Meaningful only while `deploy_status == DeploymentFailed`.
    #[serde(rename = "deployFailReason")]
    pub deploy_fail_reason: String,

    #[serde(rename = "lastAction")]
    pub last_action: Action,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Function {
    /// New function record with lifecycle defaults.
    pub fn new(
        owner: impl Into<String>,
        project_id: impl Into<String>,
        code: impl Into<String>,
        language: Language,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            project_id: project_id.into(),
            code: code.into(),
            language,
            build_status: BuildStatus::NotBuilt,
            build_fail_reason: String::new(),
            deploy_status: DeployStatus::NotDeployed,
            deploy_fail_reason: String::new(),
            last_action: Action::Create,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Per-project capability gate. Every function operation resolves the
/// (owner, project) pair to one of these first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: Uuid,
    pub owner: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub enabled: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl ProjectConfig {
    pub fn new(owner: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            project_id: project_id.into(),
            enabled: true,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_function_defaults() {
        let f = Function::new("owner-1", "project-1", "console.log(1)", Language::Nodejs);
        assert_eq!(f.build_status, BuildStatus::NotBuilt);
        assert_eq!(f.deploy_status, DeployStatus::NotDeployed);
        assert_eq!(f.last_action, Action::Create);
        assert!(f.build_fail_reason.is_empty());
        assert!(f.deploy_fail_reason.is_empty());
    }

    #[test]
    fn test_function_json_shape() {
        let f = Function::new("o", "p", "code", Language::Nodejs);
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["buildStatus"], "NotBuilt");
        assert_eq!(json["deployStatus"], "NotDeployed");
        assert_eq!(json["lastAction"], "Create");
        assert_eq!(json["language"], "nodejs");
        assert_eq!(json["projectId"], "p");
    }

    #[test]
    fn test_config_enabled_by_default() {
        let c = ProjectConfig::new("o", "p");
        assert!(c.enabled);
    }
}
