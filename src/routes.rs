use axum::{middleware, routing, Router};

use crate::auth::middleware::JwtSecret;
use crate::messages::{conversations, history, read};
use crate::notifications::routes as notification_routes;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Note: /api/messages/conversations MUST come before /api/messages/{user_id}.
    let message_routes = Router::new()
        .route(
            "/api/messages/conversations",
            routing::get(conversations::list_conversations),
        )
        .route("/api/messages", routing::post(history::send_message))
        .route("/api/messages/read/{user_id}", routing::put(read::mark_read))
        .route("/api/messages/{user_id}", routing::get(history::get_history));

    let notification_routes = Router::new()
        .route(
            "/api/notifications",
            routing::get(notification_routes::list_notifications),
        )
        .route(
            "/api/notifications/read-all",
            routing::put(notification_routes::mark_all_notifications_read),
        )
        .route(
            "/api/notifications/{id}/read",
            routing::put(notification_routes::mark_notification_read),
        );

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", routing::get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", routing::get(health_check));

    Router::new()
        .merge(message_routes)
        .merge(notification_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
