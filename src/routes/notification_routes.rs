use std::time::Duration;

use axum::{
    Router,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::{Stream, StreamExt};

use crate::{middleware::auth_context::AuthContext, models::AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/notifications/stream", get(stream))
}

/// Server-sent events for the caller's role and user id.
pub async fn stream(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    tracing::debug!(user_id = %auth.user_id, role = auth.role.as_str(), "notification stream opened");
    let events = state
        .hub
        .subscribe(auth.role, auth.user_id)
        .into_stream()
        .map(|n| Event::default().event(n.kind).json_data(n.as_ref()));
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
