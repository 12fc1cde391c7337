use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::auth::middleware::Claims;
use crate::state::AppState;
use crate::wire::{MarkReadResponse, Notification};

/// GET /api/notifications: The caller's notifications, newest first.
pub async fn list_notifications(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<Notification>>, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let notifications = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        super::list_for_user(&conn, &user_id).map_err(|e| {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to list notifications");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(notifications))
}

/// PUT /api/notifications/{id}/read: 404 unless the notification is the caller's.
pub async fn mark_notification_read(
    State(state): State<AppState>,
    claims: Claims,
    Path(notification_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let found = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        super::mark_read(&conn, &user_id, &notification_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    if found {
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

/// PUT /api/notifications/read-all
pub async fn mark_all_notifications_read(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<MarkReadResponse>, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let updated = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        super::mark_all_read(&conn, &user_id).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(MarkReadResponse { updated }))
}
