//! Conversation summaries for the authenticated user.
//!
//! A conversation is implicit: it exists once any message has been exchanged
//! with a counterpart. Its summary is derived from the latest message in
//! either direction plus the count of unread messages from the counterpart.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::auth::middleware::Claims;
use crate::state::AppState;
use crate::wire::{ConversationSummary, UserSummary};

/// Build the summaries for `user_id`, most recent first.
pub fn list_for_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<ConversationSummary>> {
    let mut stmt = conn.prepare(
        "WITH ranked AS (
            SELECT CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS counterpart,
                   content, created_at,
                   ROW_NUMBER() OVER (
                       PARTITION BY CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END
                       ORDER BY created_at DESC, id DESC
                   ) AS rn
            FROM messages
            WHERE sender_id = ?1 OR receiver_id = ?1
         )
         SELECT u.id, u.username, u.full_name, u.profile_picture,
                r.content, r.created_at,
                (SELECT COUNT(*) FROM messages x
                 WHERE x.sender_id = r.counterpart AND x.receiver_id = ?1 AND x.is_read = 0)
         FROM ranked r
         JOIN users u ON u.id = r.counterpart
         WHERE r.rn = 1
         ORDER BY r.created_at DESC, u.id ASC",
    )?;

    let rows = stmt.query_map(rusqlite::params![user_id], |row| {
        let created_at: String = row.get(5)?;
        let last_message_time = DateTime::parse_from_rfc3339(&created_at)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?;
        Ok(ConversationSummary {
            user: UserSummary {
                id: row.get(0)?,
                username: row.get(1)?,
                full_name: row.get(2)?,
                profile_picture: row.get(3)?,
            },
            last_message: row.get(4)?,
            last_message_time,
            unread_count: row.get::<_, i64>(6)?.max(0) as u32,
        })
    })?;

    rows.collect()
}

/// GET /api/messages/conversations: Conversation summaries, most recent first.
pub async fn list_conversations(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<ConversationSummary>>, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let result = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        list_for_user(&conn, &user_id).map_err(|e| {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to list conversations");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(result))
}
