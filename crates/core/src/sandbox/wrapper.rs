//! Language wrappers.
//!
//! Every artifact contains the tenant source plus a small runner that reads
//! the invocation from `$CLOUDBOX_INPUT`, calls the entry point and writes
//! an output document (`{"success", "data" | "error", "statusCode"?}`) to
//! `$CLOUDBOX_OUTPUT`. The sandboxes only differ in where those paths live.

use crate::runtime::Language;

/// Env var naming the directory that holds the artifact.
pub const ENV_FUNCTION_DIR: &str = "CLOUDBOX_FUNCTION_DIR";
/// Env var naming the invocation document path.
pub const ENV_INPUT: &str = "CLOUDBOX_INPUT";
/// Env var naming the output document path.
pub const ENV_OUTPUT: &str = "CLOUDBOX_OUTPUT";
/// Env var carrying the configured entry point.
pub const ENV_ENTRY_POINT: &str = "CLOUDBOX_ENTRY_POINT";

pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "output.json";

/// Name of the compiled Go binary inside the artifact.
pub const GO_BINARY: &str = "function";

const NODE_RUNNER: &str = r#"'use strict';
const fs = require('fs');
const path = require('path');

const fnDir = process.env.CLOUDBOX_FUNCTION_DIR;
const entry = process.env.CLOUDBOX_ENTRY_POINT || 'handler';

function writeOutput(doc) {
  fs.writeFileSync(process.env.CLOUDBOX_OUTPUT, JSON.stringify(doc));
}

(async () => {
  let input = {};
  try {
    input = JSON.parse(fs.readFileSync(process.env.CLOUDBOX_INPUT, 'utf8'));
  } catch (_) {}
  try {
    const mod = require(path.join(fnDir, 'function.js'));
    const name = entry.split('.').pop();
    const fn = typeof mod[name] === 'function' ? mod[name]
      : typeof mod.handler === 'function' ? mod.handler
      : typeof mod === 'function' ? mod : undefined;
    if (!fn) {
      throw new Error(`Entry point '${name}' is not exported by the function`);
    }
    const context = { headers: input.headers || {}, method: input.method, path: input.path };
    const result = await fn(input.data, context);
    const doc = { success: true, data: result === undefined ? null : result };
    if (result && typeof result === 'object' && Number.isInteger(result.statusCode)) {
      doc.statusCode = result.statusCode;
    }
    writeOutput(doc);
  } catch (err) {
    console.error(err && err.stack ? err.stack : String(err));
    writeOutput({ success: false, error: err && err.message ? err.message : String(err) });
    process.exitCode = 1;
  }
})();
"#;

const PYTHON_RUNNER: &str = r#"import asyncio
import importlib.util
import inspect
import json
import os
import sys
import traceback

fn_dir = os.environ["CLOUDBOX_FUNCTION_DIR"]
sys.path.insert(0, os.path.join(fn_dir, "deps"))
sys.path.insert(0, fn_dir)


def write_output(doc):
    with open(os.environ["CLOUDBOX_OUTPUT"], "w") as f:
        json.dump(doc, f, default=str)


def main():
    try:
        with open(os.environ["CLOUDBOX_INPUT"]) as f:
            event = json.load(f)
    except Exception:
        event = {}
    try:
        spec = importlib.util.spec_from_file_location("function", os.path.join(fn_dir, "function.py"))
        module = importlib.util.module_from_spec(spec)
        spec.loader.exec_module(module)
        name = os.environ.get("CLOUDBOX_ENTRY_POINT", "handler").split(".")[-1]
        fn = getattr(module, name, None) or getattr(module, "handler", None)
        if not callable(fn):
            raise RuntimeError("Entry point '%s' is not defined by the function" % name)
        context = {"headers": event.get("headers") or {}, "method": event.get("method"), "path": event.get("path")}
        params = inspect.signature(fn).parameters
        result = fn(event.get("data"), context) if len(params) >= 2 else fn(event.get("data"))
        if inspect.isawaitable(result):
            result = asyncio.run(result)
        doc = {"success": True, "data": result}
        if isinstance(result, dict) and isinstance(result.get("statusCode"), int):
            doc["statusCode"] = result["statusCode"]
        write_output(doc)
    except MemoryError:
        traceback.print_exc()
        sys.exit(137)
    except Exception as exc:
        traceback.print_exc()
        write_output({"success": False, "error": str(exc)})
        sys.exit(1)


main()
"#;

const GO_RUNNER: &str = r#"package main

import (
	"encoding/json"
	"fmt"
	"os"
)

type cloudboxEvent struct {
	Data interface{} `json:"data"`
}

func cloudboxWrite(doc map[string]interface{}) {
	raw, err := json.Marshal(doc)
	if err != nil {
		raw, _ = json.Marshal(map[string]interface{}{"success": false, "error": err.Error()})
	}
	_ = os.WriteFile(os.Getenv("CLOUDBOX_OUTPUT"), raw, 0o644)
}

func main() {
	var event cloudboxEvent
	if raw, err := os.ReadFile(os.Getenv("CLOUDBOX_INPUT")); err == nil {
		_ = json.Unmarshal(raw, &event)
	}
	defer func() {
		if r := recover(); r != nil {
			fmt.Fprintln(os.Stderr, r)
			cloudboxWrite(map[string]interface{}{"success": false, "error": fmt.Sprint(r)})
			os.Exit(1)
		}
	}()
	result, err := __ENTRY__(event.Data)
	if err != nil {
		fmt.Fprintln(os.Stderr, err)
		cloudboxWrite(map[string]interface{}{"success": false, "error": err.Error()})
		os.Exit(1)
	}
	cloudboxWrite(map[string]interface{}{"success": true, "data": result})
}
"#;

const SHELL_RUNNER: &str = r#"#!/usr/bin/env bash
set -o pipefail
source "$CLOUDBOX_FUNCTION_DIR/function.sh"
entry="${CLOUDBOX_ENTRY_POINT:-main}"
if declare -F "$entry" > /dev/null; then
  "$entry" < "$CLOUDBOX_INPUT"
fi
"#;

/// Runner file written next to the tenant source.
pub fn runner_file(language: Language) -> &'static str {
    match language {
        Language::JavaScript => "cloudbox_runner.js",
        Language::Python => "cloudbox_runner.py",
        Language::Go => "cloudbox_main.go",
        Language::Shell => "cloudbox_runner.sh",
    }
}

/// Contents of the runner for `language`.
pub fn render_runner(language: Language, entry_point: &str) -> String {
    match language {
        Language::JavaScript => NODE_RUNNER.to_string(),
        Language::Python => PYTHON_RUNNER.to_string(),
        Language::Go => GO_RUNNER.replace("__ENTRY__", go_entry(entry_point)),
        Language::Shell => SHELL_RUNNER.to_string(),
    }
}

/// Tenant source as written into the artifact.
///
/// Go sources without a package clause are placed in `package main`.
pub fn render_source(language: Language, code: &str) -> String {
    match language {
        Language::Go if !has_package_clause(code) => format!("package main\n\n{code}"),
        _ => code.to_string(),
    }
}

fn has_package_clause(code: &str) -> bool {
    code.lines()
        .map(str::trim_start)
        .find(|l| !l.is_empty() && !l.starts_with("//"))
        .is_some_and(|l| l.starts_with("package "))
}

fn go_entry(entry_point: &str) -> &str {
    entry_point.rsplit('.').next().unwrap_or(entry_point)
}

/// Program, arguments and wrapper env for running an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Build the command that starts the runner.
///
/// `function_dir` and `workspace_dir` are paths as seen by the runner, so
/// the container sandbox passes its mount points here.
pub fn launch_command(
    language: Language,
    function_dir: &str,
    workspace_dir: &str,
    entry_point: &str,
    memory_limit_mb: u32,
) -> LaunchCommand {
    let runner = format!("{function_dir}/{}", runner_file(language));
    let (program, args, mut env) = match language {
        Language::JavaScript => (
            "node".to_string(),
            vec![format!("--max-old-space-size={memory_limit_mb}"), runner],
            vec![("NODE_PATH".to_string(), format!("{function_dir}/node_modules"))],
        ),
        Language::Python => (
            "python3".to_string(),
            vec!["-u".to_string(), runner],
            vec![("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())],
        ),
        Language::Go => (format!("{function_dir}/{GO_BINARY}"), Vec::new(), Vec::new()),
        Language::Shell => ("bash".to_string(), vec![runner], Vec::new()),
    };
    env.extend([
        (ENV_FUNCTION_DIR.to_string(), function_dir.to_string()),
        (ENV_INPUT.to_string(), format!("{workspace_dir}/{INPUT_FILE}")),
        (ENV_OUTPUT.to_string(), format!("{workspace_dir}/{OUTPUT_FILE}")),
        (ENV_ENTRY_POINT.to_string(), entry_point.to_string()),
    ]);
    LaunchCommand { program, args, env }
}

/// Whether stderr shows the runtime aborting on its own heap limit.
pub fn reports_out_of_memory(language: Language, exit_code: i32, stderr: &str) -> bool {
    match language {
        Language::JavaScript => stderr.contains("JavaScript heap out of memory"),
        Language::Python => exit_code == 137 && stderr.contains("MemoryError"),
        Language::Go => stderr.contains("runtime: out of memory"),
        Language::Shell => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
