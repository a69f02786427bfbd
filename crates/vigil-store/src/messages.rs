use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{params, Connection};

use vigil_shared::types::{Message, MessageId, MessageType, UserId};

use crate::database::{format_ts, parse_ts, Database};
use crate::error::{not_found, Result, StoreError};

/// Fields supplied by the sender; id, timestamp and read flag are assigned on
/// insert.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub message_type: MessageType,
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, message_type, sent_at, read";

impl Database {
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        let sent_at = Utc::now();

        self.conn().execute(
            "INSERT INTO messages (sender_id, receiver_id, content, message_type, sent_at, read)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                new.sender_id.0,
                new.receiver_id.0,
                new.content,
                new.message_type.as_str(),
                format_ts(&sent_at),
            ],
        )?;

        Ok(Message {
            id: MessageId(self.conn().last_insert_rowid()),
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            content: new.content.clone(),
            message_type: new.message_type,
            sent_at,
            read: false,
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        fetch_message(self.conn(), id)
    }

    /// One page of the conversation between `me` and `other`, oldest first.
    /// `offset` counts back from the most recent message.
    pub fn get_conversation_messages(
        &self,
        me: UserId,
        other: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY sent_at DESC, id DESC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![me.0, other.0, limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Mark messages addressed to `reader` as read.
    ///
    /// Every id must exist and be addressed to `reader`, otherwise nothing is
    /// changed and [`StoreError::NotFound`] is returned. Messages that were
    /// already read are skipped. Returns only the messages whose flag actually
    /// flipped, so callers emit at most one receipt per message.
    pub fn mark_read(&self, reader: UserId, ids: &[MessageId]) -> Result<Vec<Message>> {
        let tx = self.conn().unchecked_transaction()?;

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            let message = fetch_message(&tx, *id)?;
            if message.receiver_id != reader {
                return Err(StoreError::NotFound);
            }
            targets.push(message);
        }

        let mut transitioned = Vec::new();
        for mut message in targets {
            if message.read {
                continue;
            }
            let affected = tx.execute(
                "UPDATE messages SET read = 1 WHERE id = ?1 AND read = 0",
                params![message.id.0],
            )?;
            if affected > 0 {
                message.read = true;
                transitioned.push(message);
            }
        }

        tx.commit()?;
        Ok(transitioned)
    }

    /// Mark every unread message from `sender` to `reader` as read. Returns
    /// the ids that flipped.
    pub fn mark_all_read(&self, reader: UserId, sender: UserId) -> Result<Vec<MessageId>> {
        let tx = self.conn().unchecked_transaction()?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM messages
                 WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![sender.0, reader.0], |row| {
                row.get::<_, i64>(0).map(MessageId)
            })?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        tx.execute(
            "UPDATE messages SET read = 1
             WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0",
            params![sender.0, reader.0],
        )?;

        tx.commit()?;
        Ok(ids)
    }
}

fn fetch_message(conn: &Connection, id: MessageId) -> Result<Message> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    conn.query_row(&sql, params![id.0], row_to_message)
        .map_err(not_found)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let type_str: String = row.get(4)?;
    let ts_str: String = row.get(5)?;

    let message_type = type_str.parse::<MessageType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        id: MessageId(row.get(0)?),
        sender_id: UserId(row.get(1)?),
        receiver_id: UserId(row.get(2)?),
        content: row.get(3)?,
        message_type,
        sent_at: parse_ts(5, &ts_str)?,
        read: row.get::<_, i64>(6)? != 0,
    })
}
