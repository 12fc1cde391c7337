//! Public profile records.
//!
//! Profile management belongs to the account service; the relay only needs
//! the id/username/name/avatar tuple embedded in messages, conversation rows
//! and notifications. `upsert_profile` is how that service (and tests) keep
//! the local copy current.

use rusqlite::Connection;

use crate::db::{self, models};
use crate::wire::UserSummary;

/// Insert a profile, or refresh the display fields of an existing one.
pub fn upsert_profile(conn: &Connection, profile: &UserSummary) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO users (id, username, full_name, profile_picture, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            username = excluded.username,
            full_name = excluded.full_name,
            profile_picture = excluded.profile_picture",
        rusqlite::params![
            profile.id,
            profile.username,
            profile.full_name,
            profile.profile_picture,
            db::now_timestamp(),
        ],
    )?;
    Ok(())
}

/// Create a profile with a fresh UUIDv7 id.
pub fn create_profile(
    conn: &Connection,
    username: &str,
    full_name: &str,
    profile_picture: &str,
) -> rusqlite::Result<UserSummary> {
    let profile = UserSummary {
        id: uuid::Uuid::now_v7().to_string(),
        username: username.to_string(),
        full_name: full_name.to_string(),
        profile_picture: profile_picture.to_string(),
    };
    upsert_profile(conn, &profile)?;
    Ok(profile)
}

pub fn find_profile(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<UserSummary>> {
    models::find_user(conn, user_id)
}
