//! Function entity model and DTOs.
//!
//! Models for the `functions` table.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use cloudbox_core::types::{DbId, Timestamp};

/// A registered function definition together with its deployment state.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Function {
    pub id: DbId,
    pub project_id: DbId,
    pub name: String,
    pub description: Option<String>,
    pub function_url: String,
    pub runtime: String,
    pub language: String,
    pub code: String,
    pub entry_point: String,
    pub dependencies: serde_json::Value,
    pub commands: Vec<String>,
    pub environment: serde_json::Value,
    pub timeout_secs: i32,
    pub memory_mb: i32,
    pub status: String,
    pub version: i32,
    pub is_active: bool,
    pub is_public: bool,
    pub build_logs: String,
    pub deployment_logs: String,
    pub build_started_at: Option<Timestamp>,
    pub last_deployed_at: Option<Timestamp>,
    pub deployed_version: Option<i32>,
    /// Host path of the deployed artifact; never exposed over the API.
    #[serde(skip_serializing)]
    pub artifact_path: Option<String>,
    pub artifact_digest: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Function {
    /// `environment` as key/value pairs, skipping non-string values.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.environment
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Request body for creating a function.
///
/// Missing fields receive defaults from the registry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateFunction {
    pub name: String,
    pub description: Option<String>,
    pub runtime: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub code: String,
    pub entry_point: Option<String>,
    #[serde(alias = "timeout")]
    pub timeout_secs: Option<i32>,
    #[serde(alias = "memory")]
    pub memory_mb: Option<i32>,
    pub environment: Option<serde_json::Value>,
    pub commands: Option<Vec<String>>,
    pub dependencies: Option<serde_json::Value>,
    pub is_public: Option<bool>,
    pub is_active: Option<bool>,
}

/// Request body for updating a function. All fields are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateFunction {
    pub name: Option<String>,
    pub description: Option<String>,
    pub runtime: Option<String>,
    pub language: Option<String>,
    pub code: Option<String>,
    pub entry_point: Option<String>,
    #[serde(alias = "timeout")]
    pub timeout_secs: Option<i32>,
    #[serde(alias = "memory")]
    pub memory_mb: Option<i32>,
    pub environment: Option<serde_json::Value>,
    pub commands: Option<Vec<String>>,
    pub dependencies: Option<serde_json::Value>,
    pub is_public: Option<bool>,
    pub is_active: Option<bool>,
}

/// A validated, defaulted row ready for insertion.
#[derive(Debug, Clone)]
pub struct NewFunction {
    pub project_id: DbId,
    pub name: String,
    pub description: Option<String>,
    pub function_url: String,
    pub runtime: String,
    pub language: String,
    pub code: String,
    pub entry_point: String,
    pub dependencies: serde_json::Value,
    pub commands: Vec<String>,
    pub environment: serde_json::Value,
    pub timeout_secs: i32,
    pub memory_mb: i32,
    pub is_active: bool,
    pub is_public: bool,
}

/// A validated partial update.
///
/// The store bumps `version` when `code` differs from the stored code and
/// resets `status` to `draft` when any build-affecting field differs, in
/// the same write as the field changes.
#[derive(Debug, Clone, Default)]
pub struct FunctionChanges {
    pub name: Option<String>,
    /// Recomputed together with `name`.
    pub function_url: Option<String>,
    pub description: Option<String>,
    pub runtime: Option<String>,
    pub language: Option<String>,
    pub code: Option<String>,
    pub entry_point: Option<String>,
    pub dependencies: Option<serde_json::Value>,
    pub commands: Option<Vec<String>>,
    pub environment: Option<serde_json::Value>,
    pub timeout_secs: Option<i32>,
    pub memory_mb: Option<i32>,
    pub is_active: Option<bool>,
    pub is_public: Option<bool>,
}

/// Fields written when a build is swapped in.
#[derive(Debug, Clone)]
pub struct BuildSuccess {
    pub artifact_path: String,
    pub artifact_digest: String,
    pub build_logs: String,
    pub deployment_logs: String,
}
