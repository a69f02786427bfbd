use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, OptionalExtension};

use vigil_shared::types::{User, UserId};

use crate::database::{format_ts, parse_ts, Database};
use crate::error::{not_found, Result, StoreError};

impl Database {
    pub fn create_user(&self, username: &str, display_name: Option<&str>) -> Result<User> {
        let now = Utc::now();

        let result = self.conn().execute(
            "INSERT INTO users (username, display_name, created_at) VALUES (?1, ?2, ?3)",
            params![username, display_name, format_ts(&now)],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Duplicate(format!("username {username:?}")));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(User {
            id: UserId(self.conn().last_insert_rowid()),
            username: username.to_string(),
            display_name: display_name.map(str::to_string),
            created_at: now,
        })
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, username, display_name, created_at FROM users WHERE id = ?1",
                params![id.0],
                |row| {
                    let ts: String = row.get(3)?;
                    Ok(User {
                        id: UserId(row.get(0)?),
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                        created_at: parse_ts(3, &ts)?,
                    })
                },
            )
            .map_err(not_found)
    }

    pub fn user_exists(&self, id: UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![id.0], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Issue a new bearer token for `user_id`. The plaintext token is returned
    /// once and never stored.
    pub fn create_session(&self, user_id: UserId) -> Result<String> {
        if !self.user_exists(user_id)? {
            return Err(StoreError::NotFound);
        }

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);

        self.conn().execute(
            "INSERT INTO sessions (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![hash_token(&token), user_id.0, format_ts(&Utc::now())],
        )?;

        tracing::debug!(user = %user_id, "issued session token");
        Ok(token)
    }

    /// Resolve a bearer token to its user, if the session exists.
    pub fn session_user(&self, token: &str) -> Result<Option<UserId>> {
        let user = self
            .conn()
            .query_row(
                "SELECT user_id FROM sessions WHERE token_hash = ?1",
                params![hash_token(token)],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(user.map(UserId))
    }

    pub fn revoke_session(&self, token: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            params![hash_token(token)],
        )?;
        Ok(affected > 0)
    }
}

fn hash_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_user() {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user("alice", Some("Alice A.")).unwrap();

        let fetched = db.get_user(user.id).unwrap();
        assert_eq!(fetched.username, "alice");
        assert_eq!(fetched.display_name.as_deref(), Some("Alice A."));
        assert!(db.user_exists(user.id).unwrap());
        assert!(!db.user_exists(UserId(999)).unwrap());
    }

    #[test]
    fn duplicate_username_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("bob", None).unwrap();
        assert!(matches!(
            db.create_user("bob", None),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn unknown_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_user(UserId(5)), Err(StoreError::NotFound)));
    }

    #[test]
    fn session_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user("carol", None).unwrap();

        let token = db.create_session(user.id).unwrap();
        assert_eq!(token.len(), 64);
        assert_eq!(db.session_user(&token).unwrap(), Some(user.id));
        assert_eq!(db.session_user("bogus").unwrap(), None);

        assert!(db.revoke_session(&token).unwrap());
        assert_eq!(db.session_user(&token).unwrap(), None);
    }

    #[test]
    fn session_for_unknown_user_fails() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.create_session(UserId(42)),
            Err(StoreError::NotFound)
        ));
    }
}
