//! Runtime catalogue.
//!
//! A function names a concrete runtime (`nodejs18`, `python3.11`, `go1.21`,
//! `bash5`, ...). Each runtime belongs to exactly one [`Language`], which
//! decides how the artifact is built, which wrapper is rendered around the
//! tenant code, and which sandbox image is used in container mode.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Runtime applied when a create request omits one.
pub const DEFAULT_RUNTIME: &str = "nodejs18";

/// Source language of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Python,
    Go,
    Shell,
}

impl Language {
    /// Canonical lowercase name stored in the `language` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::Python => "python",
            Self::Go => "go",
            Self::Shell => "shell",
        }
    }

    /// Parse a stored or user-supplied language name.
    ///
    /// Accepts a few common aliases (`js`, `node`, `py`, `golang`, `bash`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" | "node" | "nodejs" => Some(Self::JavaScript),
            "python" | "py" => Some(Self::Python),
            "go" | "golang" => Some(Self::Go),
            "shell" | "bash" | "sh" => Some(Self::Shell),
            _ => None,
        }
    }

    /// Entry point used when the definition does not name one.
    pub fn default_entry_point(self) -> &'static str {
        match self {
            Self::JavaScript => "index.handler",
            Self::Python => "handler",
            Self::Go => "Handler",
            Self::Shell => "main",
        }
    }

    /// File name the tenant code is written to inside the artifact.
    pub fn source_file(self) -> &'static str {
        match self {
            Self::JavaScript => "function.js",
            Self::Python => "function.py",
            Self::Go => "handler.go",
            Self::Shell => "function.sh",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the runtime catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpec {
    /// Runtime identifier as stored on the function (`nodejs18`).
    pub name: &'static str,
    pub language: Language,
    /// Container image used by the container sandbox.
    pub image: &'static str,
}

const CATALOGUE: &[RuntimeSpec] = &[
    RuntimeSpec { name: "nodejs14", language: Language::JavaScript, image: "node:14-alpine" },
    RuntimeSpec { name: "nodejs16", language: Language::JavaScript, image: "node:16-alpine" },
    RuntimeSpec { name: "nodejs18", language: Language::JavaScript, image: "node:18-alpine" },
    RuntimeSpec { name: "nodejs20", language: Language::JavaScript, image: "node:20-alpine" },
    RuntimeSpec { name: "python3.8", language: Language::Python, image: "python:3.8-alpine" },
    RuntimeSpec { name: "python3.9", language: Language::Python, image: "python:3.9-alpine" },
    RuntimeSpec { name: "python3.10", language: Language::Python, image: "python:3.10-alpine" },
    RuntimeSpec { name: "python3.11", language: Language::Python, image: "python:3.11-alpine" },
    RuntimeSpec { name: "python3.12", language: Language::Python, image: "python:3.12-alpine" },
    RuntimeSpec { name: "go1.19", language: Language::Go, image: "golang:1.19-alpine" },
    RuntimeSpec { name: "go1.20", language: Language::Go, image: "golang:1.20-alpine" },
    RuntimeSpec { name: "go1.21", language: Language::Go, image: "golang:1.21-alpine" },
    RuntimeSpec { name: "bash5", language: Language::Shell, image: "bash:5" },
];

/// All runtimes the engine can build and execute.
pub fn catalogue() -> &'static [RuntimeSpec] {
    CATALOGUE
}

/// Look up a runtime by its identifier (case-insensitive).
pub fn lookup(name: &str) -> Option<&'static RuntimeSpec> {
    let name = name.trim();
    CATALOGUE.iter().find(|r| r.name.eq_ignore_ascii_case(name))
}

/// Resolve the runtime/language pair of a definition.
///
/// `language` may be omitted, in which case it is inferred from the runtime.
/// When both are given they must agree.
pub fn resolve(runtime: &str, language: Option<&str>) -> Result<&'static RuntimeSpec, CoreError> {
    let spec = lookup(runtime).ok_or_else(|| {
        CoreError::Validation(format!(
            "Unsupported runtime '{runtime}'. Supported runtimes: {}",
            CATALOGUE.iter().map(|r| r.name).collect::<Vec<_>>().join(", ")
        ))
    })?;

    if let Some(language) = language.filter(|l| !l.trim().is_empty()) {
        let parsed = Language::parse(language)
            .ok_or_else(|| CoreError::Validation(format!("Unsupported language '{language}'")))?;
        if parsed != spec.language {
            return Err(CoreError::Validation(format!(
                "Runtime '{}' runs {} code, not {parsed}",
                spec.name, spec.language
            )));
        }
    }

    Ok(spec)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
