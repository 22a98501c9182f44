//! Catch-all handler feeding every non-ops request into the pipeline.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};

use crate::state::AppState;

/// Run `req` through the filter chain and the matched upstream.
///
/// Not instrumented here: the pipeline opens its own `request` span.
pub async fn proxy(State(state): State<AppState>, req: Request<Body>) -> Response<Body> {
    state.pipeline.handle(req).await
}
