//! Function registry service.
//!
//! Validates and defaults definitions before they reach the
//! [`FunctionStore`], derives function URLs, removes artifacts on delete and
//! publishes lifecycle events. Also owns the invocation preconditions used
//! by the handlers before a function is handed to the execution engine.

use std::path::PathBuf;
use std::sync::Arc;

use cloudbox_core::build::remove_function_artifacts;
use cloudbox_core::error::CoreError;
use cloudbox_core::functions::{self, status};
use cloudbox_core::runtime::{self, Language};
use cloudbox_core::types::DbId;
use cloudbox_db::models::function::{
    CreateFunction, Function, FunctionChanges, NewFunction, UpdateFunction,
};
use cloudbox_db::store::FunctionStore;
use cloudbox_events::{names, EventBus, PlatformEvent};
use serde_json::json;

use crate::error::{AppError, AppResult};

pub struct FunctionRegistry {
    store: Arc<dyn FunctionStore>,
    event_bus: Arc<EventBus>,
    base_url: String,
    artifacts_dir: PathBuf,
}

impl FunctionRegistry {
    pub fn new(
        store: Arc<dyn FunctionStore>,
        event_bus: Arc<EventBus>,
        base_url: impl Into<String>,
        artifacts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            event_bus,
            base_url: base_url.into(),
            artifacts_dir: artifacts_dir.into(),
        }
    }

    /// Validate, default and insert a new definition in `draft` at version 1.
    pub async fn create(&self, project_id: DbId, input: CreateFunction) -> AppResult<Function> {
        let name = input.name.trim().to_string();
        functions::validate_name(&name)?;

        let runtime_name = input
            .runtime
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(runtime::DEFAULT_RUNTIME);
        let spec = runtime::resolve(runtime_name, input.language.as_deref())?;

        functions::validate_code(&input.code)?;

        let entry_point = match input.entry_point.as_deref().map(str::trim) {
            Some(ep) if !ep.is_empty() => ep.to_string(),
            _ => spec.language.default_entry_point().to_string(),
        };
        functions::validate_entry_point(&entry_point)?;

        let timeout_secs = input.timeout_secs.unwrap_or(functions::DEFAULT_TIMEOUT_SECS);
        functions::validate_timeout(timeout_secs)?;
        let memory_mb = input.memory_mb.unwrap_or(functions::DEFAULT_MEMORY_MB);
        functions::validate_memory(memory_mb)?;

        let environment = input.environment.unwrap_or_else(|| json!({}));
        functions::validate_string_map("environment", &environment)?;
        let dependencies = input.dependencies.unwrap_or_else(|| json!({}));
        functions::validate_string_map("dependencies", &dependencies)?;
        let commands = input.commands.unwrap_or_default();
        functions::validate_commands(&commands)?;

        let new = NewFunction {
            project_id,
            function_url: functions::function_url(&self.base_url, project_id, &name),
            name,
            description: input.description,
            runtime: spec.name.to_string(),
            language: spec.language.as_str().to_string(),
            code: input.code,
            entry_point,
            dependencies: null_to_object(dependencies),
            commands,
            environment: null_to_object(environment),
            timeout_secs,
            memory_mb,
            is_active: input.is_active.unwrap_or(true),
            is_public: input.is_public.unwrap_or(false),
        };

        let function = self.store.create(&new).await?;
        tracing::info!(
            function_id = function.id,
            project_id,
            name = %function.name,
            runtime = %function.runtime,
            "Function created"
        );
        self.event_bus.publish(
            PlatformEvent::new(names::FUNCTION_CREATED)
                .for_function(project_id, function.id)
                .with_payload(json!({ "name": function.name, "runtime": function.runtime })),
        );
        Ok(function)
    }

    pub async fn get(&self, project_id: DbId, id: DbId) -> AppResult<Function> {
        self.store
            .find(project_id, id)
            .await?
            .ok_or(AppError::Core(CoreError::NotFound {
                entity: "function",
                id,
            }))
    }

    /// All functions of a project, ordered by name.
    pub async fn list(&self, project_id: DbId) -> AppResult<Vec<Function>> {
        Ok(self.store.list(project_id).await?)
    }

    /// Apply a partial update.
    ///
    /// The store bumps the version on a code change and resets the status
    /// to `draft` on any build-affecting change, in the same write.
    pub async fn update(&self, project_id: DbId, id: DbId, input: UpdateFunction) -> AppResult<Function> {
        let current = self.get(project_id, id).await?;
        let changes = self.changes(project_id, &current, input)?;

        let function = self
            .store
            .update(project_id, id, &changes)
            .await?
            .ok_or(AppError::Core(CoreError::NotFound {
                entity: "function",
                id,
            }))?;

        tracing::info!(
            function_id = id,
            project_id,
            version = function.version,
            status = %function.status,
            "Function updated"
        );
        self.event_bus.publish(
            PlatformEvent::new(names::FUNCTION_UPDATED)
                .for_function(project_id, id)
                .with_payload(json!({ "version": function.version, "status": function.status })),
        );
        Ok(function)
    }

    /// Remove a definition and its artifacts. Ledger rows are kept.
    pub async fn delete(&self, project_id: DbId, id: DbId) -> AppResult<()> {
        if !self.store.delete(project_id, id).await? {
            return Err(AppError::Core(CoreError::NotFound {
                entity: "function",
                id,
            }));
        }

        if let Err(e) = remove_function_artifacts(&self.artifacts_dir, id).await {
            tracing::warn!(function_id = id, error = %e, "Failed to remove function artifacts");
        }

        tracing::info!(function_id = id, project_id, "Function deleted");
        self.event_bus
            .publish(PlatformEvent::new(names::FUNCTION_DELETED).for_function(project_id, id));
        Ok(())
    }

    /// Look up a function for the public invocation path.
    ///
    /// Private and inactive functions are reported as missing so their
    /// existence is not revealed.
    pub async fn find_public(&self, project_id: DbId, name: &str) -> AppResult<Function> {
        let function = self
            .store
            .find_by_name(project_id, name)
            .await?
            .ok_or_else(|| not_public(name))?;
        ensure_public_invocable(&function)?;
        Ok(function)
    }

    fn changes(&self, project_id: DbId, current: &Function, input: UpdateFunction) -> AppResult<FunctionChanges> {
        let mut changes = FunctionChanges::default();

        if let Some(name) = input.name.map(|n| n.trim().to_string()) {
            functions::validate_name(&name)?;
            changes.function_url = Some(functions::function_url(&self.base_url, project_id, &name));
            changes.name = Some(name);
        }

        if input.runtime.is_some() || input.language.is_some() {
            let runtime_name = input.runtime.as_deref().unwrap_or(&current.runtime);
            // A new runtime without a language implies the runtime's language.
            let language = match (&input.runtime, &input.language) {
                (_, Some(language)) => Some(language.as_str()),
                (Some(_), None) => None,
                (None, None) => Some(current.language.as_str()),
            };
            let spec = runtime::resolve(runtime_name, language)?;

            // Carry a defaulted entry point over to the new language.
            let old_language = Language::parse(&current.language);
            if input.entry_point.is_none()
                && old_language != Some(spec.language)
                && old_language.map(Language::default_entry_point) == Some(current.entry_point.as_str())
            {
                changes.entry_point = Some(spec.language.default_entry_point().to_string());
            }

            changes.runtime = Some(spec.name.to_string());
            changes.language = Some(spec.language.as_str().to_string());
        }

        if let Some(code) = input.code {
            functions::validate_code(&code)?;
            changes.code = Some(code);
        }
        if let Some(entry_point) = input.entry_point.map(|e| e.trim().to_string()) {
            functions::validate_entry_point(&entry_point)?;
            changes.entry_point = Some(entry_point);
        }
        if let Some(secs) = input.timeout_secs {
            functions::validate_timeout(secs)?;
            changes.timeout_secs = Some(secs);
        }
        if let Some(mb) = input.memory_mb {
            functions::validate_memory(mb)?;
            changes.memory_mb = Some(mb);
        }
        if let Some(environment) = input.environment {
            functions::validate_string_map("environment", &environment)?;
            changes.environment = Some(null_to_object(environment));
        }
        if let Some(dependencies) = input.dependencies {
            functions::validate_string_map("dependencies", &dependencies)?;
            changes.dependencies = Some(null_to_object(dependencies));
        }
        if let Some(commands) = input.commands {
            functions::validate_commands(&commands)?;
            changes.commands = Some(commands);
        }

        changes.description = input.description;
        changes.is_active = input.is_active;
        changes.is_public = input.is_public;
        Ok(changes)
    }
}

/// Reject invocation of a function that is inactive or not deployed.
pub fn ensure_invocable(function: &Function) -> Result<(), CoreError> {
    if !function.is_active {
        return Err(CoreError::PreconditionFailed(format!(
            "Function '{}' is not active",
            function.name
        )));
    }
    if function.status != status::DEPLOYED {
        return Err(CoreError::PreconditionFailed(format!(
            "Function '{}' is not deployed (status: {})",
            function.name, function.status
        )));
    }
    Ok(())
}

/// [`ensure_invocable`] for the public path, which also requires `is_public`.
pub fn ensure_public_invocable(function: &Function) -> AppResult<()> {
    if !function.is_public || !function.is_active {
        return Err(not_public(&function.name));
    }
    ensure_invocable(function)?;
    Ok(())
}

fn not_public(name: &str) -> AppError {
    AppError::NotFound(format!("Function '{name}' not found or not public"))
}

fn null_to_object(value: serde_json::Value) -> serde_json::Value {
    if value.is_null() {
        json!({})
    } else {
        value
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
