//! Public invocation routes (no gateway token).

use axum::routing::any;
use axum::Router;

use crate::handlers::public;
use crate::state::AppState;

/// Mount public invocation routes at the root.
///
/// ```text
/// ANY    /p/{project_id}/functions/{name}   -> invoke_public
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/p/{project_id}/functions/{name}", any(public::invoke_public))
}
