//! Function definition rules: defaults, validation, lifecycle status machine,
//! public URL derivation and artifact digests.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CoreError;
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Defaults and limits
// ---------------------------------------------------------------------------

pub const DEFAULT_TIMEOUT_SECS: i32 = 30;
pub const MIN_TIMEOUT_SECS: i32 = 1;
pub const MAX_TIMEOUT_SECS: i32 = 900;

pub const DEFAULT_MEMORY_MB: i32 = 128;
pub const MIN_MEMORY_MB: i32 = 16;
pub const MAX_MEMORY_MB: i32 = 4096;

pub const MAX_NAME_LEN: usize = 64;

/// Upper bound on tenant source size (1 MiB).
pub const MAX_CODE_BYTES: usize = 1024 * 1024;

/// Maximum number of setup commands per function.
pub const MAX_COMMANDS: usize = 32;

/// Initial `build_logs` line written when a deploy is accepted.
pub const BUILD_STARTED_LOG: &str = "Starting function deployment...\n";

/// `deployment_logs` written when a build is swapped in.
pub const DEPLOYED_LOG: &str =
    "Deploying function...\nFunction deployed and ready to receive requests!\n";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

// ---------------------------------------------------------------------------
// Status machine
// ---------------------------------------------------------------------------

/// Function lifecycle status values stored in `functions.status`.
pub mod status {
    pub const DRAFT: &str = "draft";
    pub const BUILDING: &str = "building";
    pub const DEPLOYED: &str = "deployed";
    pub const FAILED: &str = "failed";

    pub const ALL: &[&str] = &[DRAFT, BUILDING, DEPLOYED, FAILED];

    /// Statuses reachable from `from` through the deploy pipeline.
    ///
    /// Edits move any non-building status back to `draft`; that reset is not
    /// a pipeline transition and is handled by the registry update.
    pub fn valid_transitions(from: &str) -> &'static [&'static str] {
        match from {
            DRAFT | FAILED => &[BUILDING],
            BUILDING => &[DEPLOYED, FAILED],
            // Redeploy of a changed definition.
            DEPLOYED => &[BUILDING],
            _ => &[],
        }
    }

    pub fn can_transition(from: &str, to: &str) -> bool {
        valid_transitions(from).contains(&to)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation("Function name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Function name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    if !NAME_RE.is_match(name) {
        return Err(CoreError::Validation(
            "Function name may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

pub fn validate_code(code: &str) -> Result<(), CoreError> {
    if code.trim().is_empty() {
        return Err(CoreError::Validation("Function code is required".into()));
    }
    if code.len() > MAX_CODE_BYTES {
        return Err(CoreError::Validation(format!(
            "Function code exceeds {MAX_CODE_BYTES} bytes"
        )));
    }
    Ok(())
}

pub fn validate_timeout(secs: i32) -> Result<(), CoreError> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) {
        return Err(CoreError::Validation(format!(
            "timeout must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} seconds"
        )));
    }
    Ok(())
}

pub fn validate_memory(mb: i32) -> Result<(), CoreError> {
    if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&mb) {
        return Err(CoreError::Validation(format!(
            "memory must be between {MIN_MEMORY_MB} and {MAX_MEMORY_MB} MB"
        )));
    }
    Ok(())
}

pub fn validate_entry_point(entry_point: &str) -> Result<(), CoreError> {
    let trimmed = entry_point.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation("entry_point must not be empty".into()));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$')
    {
        return Err(CoreError::Validation(format!(
            "entry_point '{entry_point}' is not a valid identifier"
        )));
    }
    Ok(())
}

/// `dependencies` and `environment` must be flat objects of string values.
pub fn validate_string_map(field: &str, value: &Value) -> Result<(), CoreError> {
    match value {
        Value::Null => Ok(()),
        Value::Object(map) => {
            for (key, v) in map {
                if key.is_empty() {
                    return Err(CoreError::Validation(format!("{field} keys must not be empty")));
                }
                if !v.is_string() {
                    return Err(CoreError::Validation(format!(
                        "{field}.{key} must be a string"
                    )));
                }
            }
            Ok(())
        }
        _ => Err(CoreError::Validation(format!("{field} must be an object"))),
    }
}

pub fn validate_commands(commands: &[String]) -> Result<(), CoreError> {
    if commands.len() > MAX_COMMANDS {
        return Err(CoreError::Validation(format!(
            "At most {MAX_COMMANDS} setup commands are allowed"
        )));
    }
    if commands.iter().any(|c| c.trim().is_empty()) {
        return Err(CoreError::Validation("Setup commands must not be empty".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

/// Public invocation URL for a function.
pub fn function_url(base_url: &str, project_id: DbId, name: &str) -> String {
    format!(
        "{}/p/{project_id}/functions/{}",
        base_url.trim_end_matches('/'),
        name.to_lowercase()
    )
}

/// The fields that determine what an artifact contains.
#[derive(Debug, Clone, Copy)]
pub struct BuildInputs<'a> {
    pub runtime: &'a str,
    pub language: &'a str,
    pub entry_point: &'a str,
    pub code: &'a str,
    pub dependencies: &'a Value,
    pub commands: &'a [String],
}

/// SHA-256 over everything that affects the built artifact, hex encoded.
///
/// Two definitions with the same digest produce interchangeable artifacts,
/// which lets a redeploy of an unchanged function be skipped.
pub fn artifact_digest(inputs: &BuildInputs<'_>) -> String {
    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };
    field(inputs.runtime.as_bytes());
    field(inputs.language.as_bytes());
    field(inputs.entry_point.as_bytes());
    field(inputs.code.as_bytes());
    field(inputs.dependencies.to_string().as_bytes());
    for command in inputs.commands {
        field(command.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn name_accepts_letters_digits_dash_underscore() {
        assert!(validate_name("hello-world_2").is_ok());
    }

    #[test]
    fn name_rejects_empty_and_spaces() {
        assert_matches!(validate_name(""), Err(CoreError::Validation(_)));
        assert_matches!(validate_name("hello world"), Err(CoreError::Validation(_)));
        assert_matches!(validate_name("../etc"), Err(CoreError::Validation(_)));
    }

    #[test]
    fn name_rejects_too_long() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert_matches!(validate_name(&name), Err(CoreError::Validation(_)));
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn code_must_not_be_blank() {
        assert_matches!(validate_code("   \n"), Err(CoreError::Validation(_)));
        assert!(validate_code("exports.handler = () => 1").is_ok());
    }

    #[test]
    fn timeout_bounds() {
        assert!(validate_timeout(MIN_TIMEOUT_SECS).is_ok());
        assert!(validate_timeout(MAX_TIMEOUT_SECS).is_ok());
        assert!(validate_timeout(0).is_err());
        assert!(validate_timeout(MAX_TIMEOUT_SECS + 1).is_err());
    }

    #[test]
    fn memory_bounds() {
        assert!(validate_memory(DEFAULT_MEMORY_MB).is_ok());
        assert!(validate_memory(MIN_MEMORY_MB - 1).is_err());
        assert!(validate_memory(MAX_MEMORY_MB + 1).is_err());
    }

    #[test]
    fn entry_point_rules() {
        assert!(validate_entry_point("index.handler").is_ok());
        assert!(validate_entry_point("Handler").is_ok());
        assert!(validate_entry_point("").is_err());
        assert!(validate_entry_point("a; rm -rf /").is_err());
    }

    #[test]
    fn string_map_rules() {
        assert!(validate_string_map("dependencies", &json!({"lodash": "^4.17.21"})).is_ok());
        assert!(validate_string_map("environment", &Value::Null).is_ok());
        assert!(validate_string_map("environment", &json!({"A": 1})).is_err());
        assert!(validate_string_map("environment", &json!(["A"])).is_err());
    }

    #[test]
    fn commands_rules() {
        assert!(validate_commands(&["echo hi".to_string()]).is_ok());
        assert!(validate_commands(&[" ".to_string()]).is_err());
        let many = vec!["true".to_string(); MAX_COMMANDS + 1];
        assert!(validate_commands(&many).is_err());
    }

    #[test]
    fn function_url_lowercases_and_trims_slash() {
        assert_eq!(
            function_url("https://api.cloudbox.dev/", 7, "MyFunc"),
            "https://api.cloudbox.dev/p/7/functions/myfunc"
        );
    }

    #[test]
    fn transitions() {
        assert!(status::can_transition(status::DRAFT, status::BUILDING));
        assert!(status::can_transition(status::FAILED, status::BUILDING));
        assert!(status::can_transition(status::BUILDING, status::DEPLOYED));
        assert!(status::can_transition(status::BUILDING, status::FAILED));
        assert!(status::can_transition(status::DEPLOYED, status::BUILDING));
        assert!(!status::can_transition(status::BUILDING, status::BUILDING));
        assert!(!status::can_transition(status::DRAFT, status::DEPLOYED));
        assert!(status::valid_transitions("archived").is_empty());
    }

    fn inputs<'a>(code: &'a str, deps: &'a Value, commands: &'a [String]) -> BuildInputs<'a> {
        BuildInputs {
            runtime: "nodejs18",
            language: "javascript",
            entry_point: "index.handler",
            code,
            dependencies: deps,
            commands,
        }
    }

    #[test]
    fn digest_is_stable_and_sensitive_to_code() {
        let deps = json!({});
        let a = artifact_digest(&inputs("a", &deps, &[]));
        let b = artifact_digest(&inputs("a", &deps, &[]));
        let c = artifact_digest(&inputs("b", &deps, &[]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn digest_distinguishes_field_boundaries() {
        let deps = json!({});
        let one = vec!["ab".to_string()];
        let two = vec!["a".to_string(), "b".to_string()];
        assert_ne!(
            artifact_digest(&inputs("x", &deps, &one)),
            artifact_digest(&inputs("x", &deps, &two))
        );
    }
}
