//! Conversation summaries, derived from message rows on every call.

use rusqlite::params;

use vigil_shared::types::{ConversationSummary, UserId};

use crate::database::{parse_ts, Database};
use crate::error::Result;

const CONVERSATIONS_SQL: &str = "
SELECT p.other_id,
       u.username,
       p.content,
       p.sent_at,
       (SELECT COUNT(*) FROM messages m
         WHERE m.sender_id = p.other_id AND m.receiver_id = ?1 AND m.read = 0) AS unread
FROM (
    SELECT CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS other_id,
           content,
           sent_at,
           id,
           ROW_NUMBER() OVER (
               PARTITION BY CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END
               ORDER BY sent_at DESC, id DESC
           ) AS rn
    FROM messages
    WHERE sender_id = ?1 OR receiver_id = ?1
) p
JOIN users u ON u.id = p.other_id
WHERE p.rn = 1
ORDER BY p.sent_at DESC, p.id DESC
";

impl Database {
    /// One summary per counterpart of `me`, most recent conversation first.
    pub fn list_conversations(&self, me: UserId) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn().prepare(CONVERSATIONS_SQL)?;
        let rows = stmt.query_map(params![me.0], |row| {
            let ts: String = row.get(3)?;
            Ok(ConversationSummary {
                user_id: UserId(row.get(0)?),
                username: row.get(1)?,
                last_message: row.get(2)?,
                last_message_at: parse_ts(3, &ts)?,
                unread_count: row.get::<_, i64>(4)?.max(0) as u64,
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use vigil_shared::types::MessageType;

    use crate::messages::NewMessage;

    use super::*;

    fn send(db: &Database, from: UserId, to: UserId, content: &str) {
        db.insert_message(&NewMessage {
            sender_id: from,
            receiver_id: to,
            content: content.to_string(),
            message_type: MessageType::Text,
        })
        .unwrap();
    }

    #[test]
    fn summaries_track_latest_and_unread() {
        let db = Database::open_in_memory().unwrap();
        let me = db.create_user("me", None).unwrap().id;
        let ann = db.create_user("ann", None).unwrap().id;
        let ben = db.create_user("ben", None).unwrap().id;

        send(&db, ann, me, "a1");
        send(&db, ann, me, "a2");
        send(&db, me, ben, "b1");
        send(&db, ben, me, "b2");

        let list = db.list_conversations(me).unwrap();
        assert_eq!(list.len(), 2);

        assert_eq!(list[0].user_id, ben);
        assert_eq!(list[0].username, "ben");
        assert_eq!(list[0].last_message, "b2");
        assert_eq!(list[0].unread_count, 1);

        assert_eq!(list[1].user_id, ann);
        assert_eq!(list[1].last_message, "a2");
        assert_eq!(list[1].unread_count, 2);

        db.mark_all_read(me, ann).unwrap();
        let list = db.list_conversations(me).unwrap();
        let ann_summary = list.iter().find(|c| c.user_id == ann).unwrap();
        assert_eq!(ann_summary.unread_count, 0);
    }

    #[test]
    fn own_outgoing_messages_are_never_unread() {
        let db = Database::open_in_memory().unwrap();
        let me = db.create_user("me", None).unwrap().id;
        let other = db.create_user("other", None).unwrap().id;
        send(&db, me, other, "hi");

        let list = db.list_conversations(me).unwrap();
        assert_eq!(list[0].unread_count, 0);
        assert!(db.list_conversations(UserId(77)).unwrap().is_empty());
    }
}
