//! Route definitions for function management.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::functions;
use crate::state::AppState;

/// Routes mounted at `/projects/{project_id}/functions`.
///
/// ```text
/// POST   /                          -> create_function
/// GET    /                          -> list_functions
/// GET    /{id}                      -> get_function
/// PUT    /{id}                      -> update_function
/// DELETE /{id}                      -> delete_function
/// POST   /{id}/deploy               -> deploy_function
/// POST   /{id}/execute              -> execute_function
/// GET    /{id}/logs                 -> list_executions
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(functions::list_functions).post(functions::create_function),
        )
        .route(
            "/{id}",
            get(functions::get_function)
                .put(functions::update_function)
                .delete(functions::delete_function),
        )
        .route("/{id}/deploy", post(functions::deploy_function))
        .route("/{id}/execute", post(functions::execute_function))
        .route("/{id}/logs", get(functions::list_executions))
}
