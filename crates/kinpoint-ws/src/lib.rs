mod bus;
mod handler;
mod session;

pub use bus::{route_message, BusDispatcher};

use std::collections::HashMap;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use kinpoint_core::{auth, AppState};

pub fn gateway_router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Bearer precedence: Authorization header, then `?token=`; a socket
    // arriving with neither gets one chance to supply it in an auth frame.
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(auth::bearer_from_header)
        .map(str::to_string)
        .or_else(|| params.get("token").cloned())
        .filter(|token| !token.is_empty());
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, token))
}
