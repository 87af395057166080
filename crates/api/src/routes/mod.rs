pub mod functions;
pub mod health;
pub mod public;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /projects/{project_id}/functions                      list, create
/// /projects/{project_id}/functions/{id}                 get, update, delete
/// /projects/{project_id}/functions/{id}/deploy          start deployment (POST)
/// /projects/{project_id}/functions/{id}/execute         invoke by id (POST)
/// /projects/{project_id}/functions/{id}/logs            invocation history (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/projects/{project_id}/functions", functions::router())
}
