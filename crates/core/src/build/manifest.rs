//! Dependency manifests written into artifacts.

use serde_json::{json, Map, Value};

use crate::runtime::{Language, RuntimeSpec};
use crate::types::DbId;

/// File name and contents of the manifest for `runtime`, if the language
/// has one.
pub fn render(runtime: &RuntimeSpec, function_id: DbId, dependencies: &Value) -> Option<(&'static str, String)> {
    let deps = dependencies.as_object().cloned().unwrap_or_default();
    match runtime.language {
        Language::JavaScript => Some(("package.json", package_json(function_id, &deps))),
        Language::Python => Some(("requirements.txt", requirements_txt(&deps))),
        Language::Go => Some(("go.mod", go_mod(runtime, &deps))),
        Language::Shell => None,
    }
}

fn package_json(function_id: DbId, deps: &Map<String, Value>) -> String {
    let doc = json!({
        "name": format!("cloudbox-function-{function_id}"),
        "version": "1.0.0",
        "private": true,
        "main": "function.js",
        "dependencies": deps,
    });
    serde_json::to_string_pretty(&doc).unwrap_or_default()
}

fn requirements_txt(deps: &Map<String, Value>) -> String {
    deps.iter()
        .map(|(name, version)| {
            let version = version.as_str().unwrap_or("").trim();
            if version.is_empty() || version == "*" || version.eq_ignore_ascii_case("latest") {
                format!("{name}\n")
            } else if version.starts_with(['=', '>', '<', '~', '!']) {
                format!("{name}{version}\n")
            } else {
                format!("{name}=={version}\n")
            }
        })
        .collect()
}

fn go_mod(runtime: &RuntimeSpec, deps: &Map<String, Value>) -> String {
    let go_version = runtime.name.trim_start_matches("go");
    let mut out = format!("module cloudbox/function\n\ngo {go_version}\n");
    if !deps.is_empty() {
        out.push_str("\nrequire (\n");
        for (module, version) in deps {
            out.push_str(&format!("\t{module} {}\n", version.as_str().unwrap_or("latest")));
        }
        out.push_str(")\n");
    }
    out
}

/// Whether the definition declares any dependencies.
pub fn has_dependencies(dependencies: &Value) -> bool {
    dependencies.as_object().is_some_and(|m| !m.is_empty())
}
