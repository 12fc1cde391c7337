//! Message history and sending.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rusqlite::Connection;

use crate::auth::middleware::Claims;
use crate::db::{self, models};
use crate::state::AppState;
use crate::wire::{Message, SendMessageRequest};

/// Maximum message content length (chars).
pub const MAX_CONTENT_LENGTH: usize = 4000;

/// All messages between two users, oldest first.
pub fn load_history(conn: &Connection, user_id: &str, counterpart_id: &str) -> rusqlite::Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages m JOIN users s ON s.id = m.sender_id
         WHERE (m.sender_id = ?1 AND m.receiver_id = ?2)
            OR (m.sender_id = ?2 AND m.receiver_id = ?1)
         ORDER BY m.created_at ASC, m.id ASC",
        models::MESSAGE_COLUMNS
    ))?;
    let rows = stmt.query_map(rusqlite::params![user_id, counterpart_id], models::message_from_row)?;
    rows.collect()
}

/// Persist a message and return it with the sender profile attached.
pub fn insert_message(
    conn: &Connection,
    sender_id: &str,
    receiver_id: &str,
    content: &str,
) -> rusqlite::Result<Message> {
    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO messages (id, sender_id, receiver_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![id, sender_id, receiver_id, content, db::now_timestamp()],
    )?;
    models::find_message(conn, &id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

/// GET /api/messages/{userId}: Full history with a counterpart, oldest first.
pub async fn get_history(
    State(state): State<AppState>,
    claims: Claims,
    Path(counterpart_id): Path<String>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let messages = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        load_history(&conn, &user_id, &counterpart_id).map_err(|e| {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to load history");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(messages))
}

/// POST /api/messages: Store a message. Body: `{ "receiverId", "content" }`.
///
/// Live delivery is not triggered here: the sender's client emits
/// `send-message` once it holds the server id, and the push channel relays it.
pub async fn send_message(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), StatusCode> {
    let content = body.content.trim().to_string();
    if content.is_empty() || content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(StatusCode::BAD_REQUEST);
    }
    if body.receiver_id == claims.sub {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.db.clone();
    let sender_id = claims.sub;
    let receiver_id = body.receiver_id;

    let message = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        if models::find_user(&conn, &receiver_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .is_none()
        {
            return Err(StatusCode::NOT_FOUND);
        }
        if models::find_user(&conn, &sender_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .is_none()
        {
            return Err(StatusCode::FORBIDDEN);
        }

        insert_message(&conn, &sender_id, &receiver_id, &content).map_err(|e| {
            tracing::warn!(sender_id = %sender_id, error = %e, "Failed to store message");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    tracing::debug!(
        message_id = %message.id,
        sender_id = %message.sender.id,
        receiver_id = %message.receiver_id,
        "Message stored"
    );

    Ok((StatusCode::CREATED, Json(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{conversations, read};
    use crate::profiles;

    fn memory_db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::migrations().to_latest(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_history_is_oldest_first_in_both_directions() {
        let conn = memory_db();
        let me = profiles::create_profile(&conn, "me", "", "").unwrap();
        let u1 = profiles::create_profile(&conn, "u1", "", "").unwrap();

        let a = insert_message(&conn, &u1.id, &me.id, "first").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let b = insert_message(&conn, &me.id, &u1.id, "second").unwrap();

        let history = load_history(&conn, &me.id, &u1.id).unwrap();
        let ids: Vec<&str> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
        assert_eq!(history[0].sender.username, "u1");
    }

    #[test]
    fn test_conversations_carry_unread_and_order() {
        let conn = memory_db();
        let me = profiles::create_profile(&conn, "me", "", "").unwrap();
        let u1 = profiles::create_profile(&conn, "u1", "User One", "").unwrap();
        let u2 = profiles::create_profile(&conn, "u2", "", "").unwrap();

        for text in ["a", "b", "c"] {
            insert_message(&conn, &u1.id, &me.id, text).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(3));
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        insert_message(&conn, &me.id, &u2.id, "hi u2").unwrap();

        let list = conversations::list_for_user(&conn, &me.id).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].user.id, u2.id);
        assert_eq!(list[0].last_message, "hi u2");
        assert_eq!(list[0].unread_count, 0);
        assert_eq!(list[1].user.id, u1.id);
        assert_eq!(list[1].last_message, "c");
        assert_eq!(list[1].unread_count, 3);

        assert_eq!(read::mark_conversation_read(&conn, &me.id, &u1.id).unwrap(), 3);
        assert_eq!(read::mark_conversation_read(&conn, &me.id, &u1.id).unwrap(), 0);
        let list = conversations::list_for_user(&conn, &me.id).unwrap();
        assert!(list.iter().all(|c| c.unread_count == 0));
    }
}
