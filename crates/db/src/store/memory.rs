//! In-memory stores with the same semantics as the Postgres ones.
//!
//! Each operation holds the store's write lock for its whole read-modify-
//! write, which gives the same atomicity as the single-statement SQL.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use cloudbox_core::functions::status;
use cloudbox_core::types::{DbId, Timestamp};
use tokio::sync::RwLock;

use super::{BuildClaim, ExecutionStore, FunctionStore, StoreError};
use crate::models::execution::{FunctionExecution, NewExecution};
use crate::models::function::{BuildSuccess, Function, FunctionChanges, NewFunction};

struct Table<T> {
    next_id: DbId,
    rows: BTreeMap<DbId, T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            rows: BTreeMap::new(),
        }
    }
}

impl<T> Table<T> {
    fn allocate_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory [`FunctionStore`].
#[derive(Default)]
pub struct MemoryFunctionStore {
    table: RwLock<Table<Function>>,
}

impl MemoryFunctionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn name_taken(table: &Table<Function>, project_id: DbId, name: &str, except: Option<DbId>) -> bool {
    table.rows.values().any(|f| {
        f.project_id == project_id && f.name.eq_ignore_ascii_case(name) && Some(f.id) != except
    })
}

fn conflict(name: &str) -> StoreError {
    StoreError::Conflict(format!("A function named '{name}' already exists in this project"))
}

fn changed<T: PartialEq>(new: &Option<T>, current: &T) -> bool {
    new.as_ref().is_some_and(|v| v != current)
}

#[async_trait]
impl FunctionStore for MemoryFunctionStore {
    async fn create(&self, new: &NewFunction) -> Result<Function, StoreError> {
        let mut table = self.table.write().await;
        if name_taken(&table, new.project_id, &new.name, None) {
            return Err(conflict(&new.name));
        }
        let now = Utc::now();
        let function = Function {
            id: table.allocate_id(),
            project_id: new.project_id,
            name: new.name.clone(),
            description: new.description.clone(),
            function_url: new.function_url.clone(),
            runtime: new.runtime.clone(),
            language: new.language.clone(),
            code: new.code.clone(),
            entry_point: new.entry_point.clone(),
            dependencies: new.dependencies.clone(),
            commands: new.commands.clone(),
            environment: new.environment.clone(),
            timeout_secs: new.timeout_secs,
            memory_mb: new.memory_mb,
            status: status::DRAFT.to_string(),
            version: 1,
            is_active: new.is_active,
            is_public: new.is_public,
            build_logs: String::new(),
            deployment_logs: String::new(),
            build_started_at: None,
            last_deployed_at: None,
            deployed_version: None,
            artifact_path: None,
            artifact_digest: None,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(function.id, function.clone());
        Ok(function)
    }

    async fn find(&self, project_id: DbId, id: DbId) -> Result<Option<Function>, StoreError> {
        let table = self.table.read().await;
        Ok(table.rows.get(&id).filter(|f| f.project_id == project_id).cloned())
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Function>, StoreError> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn find_by_name(&self, project_id: DbId, name: &str) -> Result<Option<Function>, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .values()
            .find(|f| f.project_id == project_id && f.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn list(&self, project_id: DbId) -> Result<Vec<Function>, StoreError> {
        let table = self.table.read().await;
        let mut functions: Vec<Function> = table
            .rows
            .values()
            .filter(|f| f.project_id == project_id)
            .cloned()
            .collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(functions)
    }

    async fn update(
        &self,
        project_id: DbId,
        id: DbId,
        changes: &FunctionChanges,
    ) -> Result<Option<Function>, StoreError> {
        let mut table = self.table.write().await;
        if let Some(name) = &changes.name {
            if name_taken(&table, project_id, name, Some(id)) {
                return Err(conflict(name));
            }
        }
        let Some(f) = table.rows.get_mut(&id).filter(|f| f.project_id == project_id) else {
            return Ok(None);
        };

        let code_changed = changed(&changes.code, &f.code);
        let rebuild_needed = code_changed
            || changed(&changes.runtime, &f.runtime)
            || changed(&changes.language, &f.language)
            || changed(&changes.entry_point, &f.entry_point)
            || changed(&changes.dependencies, &f.dependencies)
            || changed(&changes.commands, &f.commands);

        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(v) = &changes.$field { f.$field = v.clone(); })*
            };
        }
        apply!(name, function_url, runtime, language, code, entry_point, dependencies, commands, environment);
        if let Some(d) = &changes.description {
            f.description = Some(d.clone());
        }
        if let Some(v) = changes.timeout_secs {
            f.timeout_secs = v;
        }
        if let Some(v) = changes.memory_mb {
            f.memory_mb = v;
        }
        if let Some(v) = changes.is_active {
            f.is_active = v;
        }
        if let Some(v) = changes.is_public {
            f.is_public = v;
        }

        if code_changed {
            f.version += 1;
        }
        if rebuild_needed {
            f.status = status::DRAFT.to_string();
        }
        f.updated_at = Utc::now();
        Ok(Some(f.clone()))
    }

    async fn delete(&self, project_id: DbId, id: DbId) -> Result<bool, StoreError> {
        let mut table = self.table.write().await;
        match table.rows.get(&id) {
            Some(f) if f.project_id == project_id => {
                table.rows.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn begin_build(&self, project_id: DbId, id: DbId, initial_log: &str) -> Result<BuildClaim, StoreError> {
        let mut table = self.table.write().await;
        let Some(f) = table.rows.get_mut(&id).filter(|f| f.project_id == project_id) else {
            return Ok(BuildClaim::NotFound);
        };
        if f.status == status::BUILDING {
            return Ok(BuildClaim::AlreadyBuilding(f.clone()));
        }
        let now = Utc::now();
        f.status = status::BUILDING.to_string();
        f.build_logs = initial_log.to_string();
        f.build_started_at = Some(now);
        f.updated_at = now;
        Ok(BuildClaim::Claimed(f.clone()))
    }

    async fn complete_build(
        &self,
        id: DbId,
        version: i32,
        result: &BuildSuccess,
    ) -> Result<Option<Function>, StoreError> {
        let mut table = self.table.write().await;
        let Some(f) = table
            .rows
            .get_mut(&id)
            .filter(|f| f.version == version && f.status == status::BUILDING)
        else {
            return Ok(None);
        };
        let now = Utc::now();
        f.status = status::DEPLOYED.to_string();
        f.deployed_version = Some(f.version);
        f.artifact_path = Some(result.artifact_path.clone());
        f.artifact_digest = Some(result.artifact_digest.clone());
        f.build_logs = result.build_logs.clone();
        f.deployment_logs = result.deployment_logs.clone();
        f.last_deployed_at = Some(now);
        f.updated_at = now;
        Ok(Some(f.clone()))
    }

    async fn fail_build(&self, id: DbId, version: i32, build_logs: &str) -> Result<Option<Function>, StoreError> {
        let mut table = self.table.write().await;
        let Some(f) = table
            .rows
            .get_mut(&id)
            .filter(|f| f.version == version && f.status == status::BUILDING)
        else {
            return Ok(None);
        };
        f.status = status::FAILED.to_string();
        f.build_logs = build_logs.to_string();
        f.updated_at = Utc::now();
        Ok(Some(f.clone()))
    }

    async fn fail_stuck_builds(&self, started_before: Timestamp, message: &str) -> Result<Vec<Function>, StoreError> {
        let mut table = self.table.write().await;
        let now = Utc::now();
        let mut failed = Vec::new();
        for f in table.rows.values_mut() {
            let stuck = f.status == status::BUILDING
                && f.build_started_at.map_or(true, |started| started < started_before);
            if stuck {
                f.status = status::FAILED.to_string();
                f.build_logs.push_str(message);
                f.updated_at = now;
                failed.push(f.clone());
            }
        }
        Ok(failed)
    }
}

/// In-memory [`ExecutionStore`].
#[derive(Default)]
pub struct MemoryExecutionStore {
    table: RwLock<Table<FunctionExecution>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, new: &NewExecution) -> Result<FunctionExecution, StoreError> {
        let mut table = self.table.write().await;
        if table.rows.values().any(|e| e.execution_id == new.execution_id) {
            return Err(StoreError::Conflict(format!(
                "Execution '{}' already recorded",
                new.execution_id
            )));
        }
        let row = FunctionExecution {
            id: table.allocate_id(),
            execution_id: new.execution_id.clone(),
            function_id: new.function_id,
            project_id: new.project_id,
            function_version: new.function_version,
            request_data: new.request_data.clone(),
            headers: new.headers.clone(),
            method: new.method.clone(),
            path: new.path.clone(),
            source: new.source.clone(),
            client_ip: new.client_ip.clone(),
            user_agent: new.user_agent.clone(),
            status: new.status.clone(),
            status_code: new.status_code,
            response_data: new.response_data.clone(),
            error_message: new.error_message.clone(),
            error_code: new.error_code.clone(),
            logs: new.logs.clone(),
            execution_time_ms: new.execution_time_ms,
            memory_usage_bytes: new.memory_usage_bytes,
            started_at: new.started_at,
            completed_at: new.completed_at,
            created_at: Utc::now(),
        };
        table.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_by_function(
        &self,
        project_id: DbId,
        function_id: DbId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FunctionExecution>, StoreError> {
        let table = self.table.read().await;
        let mut rows: Vec<&FunctionExecution> = table
            .rows
            .values()
            .filter(|e| e.project_id == project_id && e.function_id == function_id)
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_by_function(&self, project_id: DbId, function_id: DbId) -> Result<i64, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .values()
            .filter(|e| e.project_id == project_id && e.function_id == function_id)
            .count() as i64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn new_function(project_id: DbId, name: &str) -> NewFunction {
        NewFunction {
            project_id,
            name: name.to_string(),
            description: None,
            function_url: format!("http://localhost/p/{project_id}/functions/{}", name.to_lowercase()),
            runtime: "nodejs18".into(),
            language: "javascript".into(),
            code: "exports.handler = (d) => d;".into(),
            entry_point: "index.handler".into(),
            dependencies: json!({}),
            commands: vec![],
            environment: json!({}),
            timeout_secs: 30,
            memory_mb: 128,
            is_active: true,
            is_public: false,
        }
    }

    fn success(path: &str) -> BuildSuccess {
        BuildSuccess {
            artifact_path: path.into(),
            artifact_digest: "d".into(),
            build_logs: "[build] ok\n".into(),
            deployment_logs: "deployed\n".into(),
        }
    }

    #[tokio::test]
    async fn create_starts_in_draft_at_version_one() {
        let store = MemoryFunctionStore::new();
        let f = store.create(&new_function(1, "hello")).await.unwrap();
        assert_eq!(f.status, status::DRAFT);
        assert_eq!(f.version, 1);
    }

    #[tokio::test]
    async fn names_are_unique_per_project_case_insensitively() {
        let store = MemoryFunctionStore::new();
        store.create(&new_function(1, "Hello")).await.unwrap();
        assert_matches!(store.create(&new_function(1, "hello")).await, Err(StoreError::Conflict(_)));
        assert!(store.create(&new_function(2, "hello")).await.is_ok());
        assert_eq!(store.find_by_name(1, "HELLO").await.unwrap().unwrap().name, "Hello");
    }

    #[tokio::test]
    async fn code_change_bumps_version_and_resets_status() {
        let store = MemoryFunctionStore::new();
        let f = store.create(&new_function(1, "f")).await.unwrap();
        store.begin_build(1, f.id, "start\n").await.unwrap();
        store.complete_build(f.id, 1, &success("/a/1")).await.unwrap().unwrap();

        let changes = FunctionChanges {
            code: Some("exports.handler = () => 2;".into()),
            ..Default::default()
        };
        let updated = store.update(1, f.id, &changes).await.unwrap().unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, status::DRAFT);

        // Same code again: no bump.
        let again = store.update(1, f.id, &changes).await.unwrap().unwrap();
        assert_eq!(again.version, 2);
    }

    #[tokio::test]
    async fn metadata_change_keeps_deployment() {
        let store = MemoryFunctionStore::new();
        let f = store.create(&new_function(1, "f")).await.unwrap();
        store.begin_build(1, f.id, "start\n").await.unwrap();
        store.complete_build(f.id, 1, &success("/a/1")).await.unwrap().unwrap();

        let changes = FunctionChanges {
            timeout_secs: Some(5),
            is_public: Some(true),
            ..Default::default()
        };
        let updated = store.update(1, f.id, &changes).await.unwrap().unwrap();
        assert_eq!(updated.status, status::DEPLOYED);
        assert_eq!(updated.version, 1);
        assert_eq!(updated.timeout_secs, 5);
    }

    #[tokio::test]
    async fn dependency_change_resets_without_bump() {
        let store = MemoryFunctionStore::new();
        let f = store.create(&new_function(1, "f")).await.unwrap();
        let changes = FunctionChanges {
            dependencies: Some(json!({"lodash": "4"})),
            ..Default::default()
        };
        store.begin_build(1, f.id, "").await.unwrap();
        let updated = store.update(1, f.id, &changes).await.unwrap().unwrap();
        assert_eq!(updated.status, status::DRAFT);
        assert_eq!(updated.version, 1);
    }

    #[tokio::test]
    async fn begin_build_is_compare_and_set() {
        let store = MemoryFunctionStore::new();
        let f = store.create(&new_function(1, "f")).await.unwrap();
        assert_matches!(store.begin_build(1, f.id, "a").await.unwrap(), BuildClaim::Claimed(_));
        assert_matches!(store.begin_build(1, f.id, "b").await.unwrap(), BuildClaim::AlreadyBuilding(_));
        assert_matches!(store.begin_build(2, f.id, "c").await.unwrap(), BuildClaim::NotFound);
    }

    #[tokio::test]
    async fn complete_build_is_guarded_by_version() {
        let store = MemoryFunctionStore::new();
        let f = store.create(&new_function(1, "f")).await.unwrap();
        store.begin_build(1, f.id, "").await.unwrap();
        let edit = FunctionChanges {
            code: Some("changed".into()),
            ..Default::default()
        };
        store.update(1, f.id, &edit).await.unwrap();

        assert!(store.complete_build(f.id, 1, &success("/a/1")).await.unwrap().is_none());
        let row = store.find_by_id(f.id).await.unwrap().unwrap();
        assert_eq!(row.status, status::DRAFT);
        assert_eq!(row.artifact_path, None);
    }

    #[tokio::test]
    async fn stuck_builds_are_failed() {
        let store = MemoryFunctionStore::new();
        let f = store.create(&new_function(1, "f")).await.unwrap();
        store.begin_build(1, f.id, "start\n").await.unwrap();

        let failed = store
            .fail_stuck_builds(Utc::now() + chrono::Duration::seconds(1), "timed out\n")
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, status::FAILED);
        assert_eq!(failed[0].build_logs, "start\ntimed out\n");
    }

    #[tokio::test]
    async fn execution_history_is_newest_first_and_paged() {
        let store = MemoryExecutionStore::new();
        let base = Utc::now();
        for i in 0..5 {
            let started = base + chrono::Duration::seconds(i);
            store
                .insert(&NewExecution {
                    execution_id: format!("e{i}"),
                    function_id: 1,
                    project_id: 1,
                    function_version: 1,
                    request_data: None,
                    headers: json!({}),
                    method: "POST".into(),
                    path: "/".into(),
                    source: "http".into(),
                    client_ip: None,
                    user_agent: None,
                    status: "success".into(),
                    status_code: 200,
                    response_data: None,
                    error_message: None,
                    error_code: None,
                    logs: String::new(),
                    execution_time_ms: 1,
                    memory_usage_bytes: None,
                    started_at: started,
                    completed_at: started,
                })
                .await
                .unwrap();
        }
        let page = store.list_by_function(1, 1, 2, 1).await.unwrap();
        let ids: Vec<_> = page.iter().map(|e| e.execution_id.as_str()).collect();
        assert_eq!(ids, vec!["e3", "e2"]);
        assert_eq!(store.count_by_function(1, 1).await.unwrap(), 5);
        assert_eq!(store.count_by_function(2, 1).await.unwrap(), 0);
    }
}
