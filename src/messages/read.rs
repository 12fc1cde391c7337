use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rusqlite::Connection;

use crate::auth::middleware::Claims;
use crate::state::AppState;
use crate::wire::MarkReadResponse;

/// Mark every unread message from `counterpart_id` to `user_id` as read.
pub fn mark_conversation_read(
    conn: &Connection,
    user_id: &str,
    counterpart_id: &str,
) -> rusqlite::Result<u64> {
    let updated = conn.execute(
        "UPDATE messages SET is_read = 1
         WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
        rusqlite::params![counterpart_id, user_id],
    )?;
    Ok(updated as u64)
}

/// PUT /api/messages/read/{userId}: Read receipt for a whole conversation.
/// Idempotent: repeating it reports `updated: 0`.
pub async fn mark_read(
    State(state): State<AppState>,
    claims: Claims,
    Path(counterpart_id): Path<String>,
) -> Result<Json<MarkReadResponse>, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let updated = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        mark_conversation_read(&conn, &user_id, &counterpart_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(MarkReadResponse { updated }))
}
