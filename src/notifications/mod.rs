//! Notifications: persisted server-side, announced over the push channel,
//! read and acknowledged through REST.

pub mod routes;

use rusqlite::Connection;

use crate::db::{self, models};
use crate::state::AppState;
use crate::wire::{Notification, NotificationKind, NotificationSignal, ServerFrame};
use crate::ws::broadcast::send_to_user;

/// A notification about to be created by one of the triggering services
/// (likes, comments, follows).
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient_id: String,
    pub sender_id: String,
    pub kind: NotificationKind,
    pub post_id: Option<String>,
}

pub fn insert_notification(conn: &Connection, new: &NewNotification) -> rusqlite::Result<Notification> {
    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO notifications (id, recipient_id, sender_id, kind, post_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id,
            new.recipient_id,
            new.sender_id,
            new.kind.as_str(),
            new.post_id,
            db::now_timestamp(),
        ],
    )?;
    conn.query_row(
        &format!(
            "SELECT {} FROM notifications n JOIN users s ON s.id = n.sender_id WHERE n.id = ?1",
            models::NOTIFICATION_COLUMNS
        ),
        rusqlite::params![id],
        models::notification_from_row,
    )
}

pub fn list_for_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<Notification>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM notifications n JOIN users s ON s.id = n.sender_id
         WHERE n.recipient_id = ?1
         ORDER BY n.created_at DESC, n.id DESC",
        models::NOTIFICATION_COLUMNS
    ))?;
    let rows = stmt.query_map(rusqlite::params![user_id], models::notification_from_row)?;
    rows.collect()
}

/// Returns false when the notification does not exist or is not the user's.
pub fn mark_read(conn: &Connection, user_id: &str, notification_id: &str) -> rusqlite::Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM notifications WHERE id = ?1 AND recipient_id = ?2)",
        rusqlite::params![notification_id, user_id],
        |row| row.get(0),
    )?;
    if exists {
        conn.execute(
            "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND recipient_id = ?2",
            rusqlite::params![notification_id, user_id],
        )?;
    }
    Ok(exists)
}

pub fn mark_all_read(conn: &Connection, user_id: &str) -> rusqlite::Result<u64> {
    let updated = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
        rusqlite::params![user_id],
    )?;
    Ok(updated as u64)
}

/// Persist a notification and push `new-notification` to the recipient.
/// Self-notifications (liking your own post) are dropped and return `Ok(None)`.
pub async fn publish_notification(
    state: &AppState,
    new: NewNotification,
) -> Result<Option<Notification>, Box<dyn std::error::Error + Send + Sync>> {
    if new.recipient_id == new.sender_id {
        return Ok(None);
    }

    let db = state.db.clone();
    let notification = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| format!("DB lock error: {}", e))?;
        insert_notification(&conn, &new)
            .map(|n| (n, new.recipient_id))
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    })
    .await??;

    let (notification, recipient_id) = notification;
    let delivered = send_to_user(
        &state.connections,
        &recipient_id,
        &ServerFrame::NewNotification(NotificationSignal {
            id: Some(notification.id.clone()),
        }),
    );
    tracing::debug!(
        recipient_id = %recipient_id,
        notification_id = %notification.id,
        kind = notification.kind.as_str(),
        delivered,
        "Notification published"
    );

    Ok(Some(notification))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles;

    fn memory_db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::migrations().to_latest(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_insert_list_and_mark() {
        let conn = memory_db();
        let me = profiles::create_profile(&conn, "me", "", "").unwrap();
        let fan = profiles::create_profile(&conn, "fan", "Big Fan", "").unwrap();

        let like = insert_notification(
            &conn,
            &NewNotification {
                recipient_id: me.id.clone(),
                sender_id: fan.id.clone(),
                kind: NotificationKind::Like,
                post_id: Some("post-1".to_string()),
            },
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let follow = insert_notification(
            &conn,
            &NewNotification {
                recipient_id: me.id.clone(),
                sender_id: fan.id.clone(),
                kind: NotificationKind::Follow,
                post_id: None,
            },
        )
        .unwrap();

        let list = list_for_user(&conn, &me.id).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, follow.id);
        assert_eq!(list[1].post.as_deref(), Some("post-1"));
        assert_eq!(list[1].sender.full_name, "Big Fan");

        assert!(mark_read(&conn, &me.id, &like.id).unwrap());
        assert!(!mark_read(&conn, &fan.id, &like.id).unwrap());
        assert_eq!(mark_all_read(&conn, &me.id).unwrap(), 1);
        assert_eq!(mark_all_read(&conn, &me.id).unwrap(), 0);
        assert!(list_for_user(&conn, &me.id).unwrap().iter().all(|n| n.is_read));
    }
}
