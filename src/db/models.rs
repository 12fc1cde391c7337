//! Row mappers shared by the REST handlers and the push dispatcher.
//! Column order in each `*_COLUMNS` constant matches the mapper below it.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::wire::{Message, Notification, NotificationKind, UserSummary};

/// Columns for [`user_from_row`], selected from `users`.
pub const USER_COLUMNS: &str = "id, username, full_name, profile_picture";

/// Columns for [`message_from_row`]: `messages m` joined with `users s` (the sender).
pub const MESSAGE_COLUMNS: &str = "m.id, m.receiver_id, m.content, m.created_at, m.is_read,
     s.id, s.username, s.full_name, s.profile_picture";

/// Columns for [`notification_from_row`]: `notifications n` joined with `users s` (the sender).
pub const NOTIFICATION_COLUMNS: &str = "n.id, n.kind, n.post_id, n.is_read, n.created_at,
     s.id, s.username, s.full_name, s.profile_picture";

fn parse_timestamp(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn user_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<UserSummary> {
    Ok(UserSummary {
        id: row.get(offset)?,
        username: row.get(offset + 1)?,
        full_name: row.get(offset + 2)?,
        profile_picture: row.get(offset + 3)?,
    })
}

pub fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserSummary> {
    user_at(row, 0)
}

pub fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let created_at: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        receiver_id: row.get(1)?,
        content: row.get(2)?,
        created_at: parse_timestamp(&created_at, 3)?,
        is_read: row.get::<_, i64>(4)? != 0,
        sender: user_at(row, 5)?,
    })
}

pub fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let kind: String = row.get(1)?;
    let created_at: String = row.get(4)?;
    Ok(Notification {
        id: row.get(0)?,
        kind: NotificationKind::from_str(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown notification kind {kind}").into(),
            )
        })?,
        post: row.get(2)?,
        is_read: row.get::<_, i64>(3)? != 0,
        created_at: parse_timestamp(&created_at, 4)?,
        sender: user_at(row, 5)?,
    })
}

/// Look up a public profile by id.
pub fn find_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<UserSummary>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        rusqlite::params![user_id],
        user_from_row,
    )
    .optional()
}

/// Load a single message with its sender profile.
pub fn find_message(conn: &Connection, message_id: &str) -> rusqlite::Result<Option<Message>> {
    conn.query_row(
        &format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m JOIN users s ON s.id = m.sender_id WHERE m.id = ?1"
        ),
        rusqlite::params![message_id],
        message_from_row,
    )
    .optional()
}
