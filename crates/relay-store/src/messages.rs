use serde::Serialize;
use tracing::instrument;

use relay_core::MessageRecord;

use crate::database::Database;
use crate::error::StoreError;

/// A persisted message together with its row id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    #[serde(rename = "_id", serialize_with = "id_as_string")]
    pub id: i64,
    #[serde(flatten)]
    pub record: MessageRecord,
}

fn id_as_string<S: serde::Serializer>(id: &i64, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(id)
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a record. Returns the assigned row id.
    #[instrument(skip(self, record), fields(from = %record.from, to = %record.to))]
    pub fn append(&self, record: &MessageRecord) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (from_user, to_user, text, timestamp) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![record.from, record.to, record.text, record.timestamp],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Records where `user_id` is sender or recipient, oldest first, at most `limit`.
    #[instrument(skip(self))]
    pub fn history_for(&self, user_id: &str, limit: u32) -> Result<Vec<StoredMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_user, to_user, text, timestamp FROM messages
                 WHERE from_user = ?1 OR to_user = ?1
                 ORDER BY timestamp ASC, id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], |row| {
                    Ok(StoredMessage {
                        id: row.get(0)?,
                        record: MessageRecord {
                            from: row.get(1)?,
                            to: row.get(2)?,
                            text: row.get(3)?,
                            timestamp: row.get(4)?,
                        },
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::MessageDraft;

    fn repo() -> MessageRepo {
        MessageRepo::new(Database::in_memory().unwrap())
    }

    fn rec(from: &str, to: &str, text: &str, ts: &str) -> MessageRecord {
        MessageDraft::new(from, to, text).with_timestamp(ts).stamp()
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let repo = repo();
        let a = repo.append(&rec("A", "B", "one", "T1")).unwrap();
        let b = repo.append(&rec("A", "B", "two", "T2")).unwrap();
        assert!(b > a);
        assert_eq!(repo.count().unwrap(), 2);
    }

    #[test]
    fn history_matches_sender_or_recipient() {
        let repo = repo();
        repo.append(&rec("A", "B", "ab", "T1")).unwrap();
        repo.append(&rec("B", "A", "ba", "T2")).unwrap();
        repo.append(&rec("C", "D", "cd", "T3")).unwrap();

        let history = repo.history_for("A", 100).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.record.from == "A" || m.record.to == "A"));
        assert!(repo.history_for("Z", 100).unwrap().is_empty());
    }

    #[test]
    fn history_sorted_ascending_by_timestamp() {
        let repo = repo();
        repo.append(&rec("A", "B", "late", "2024-01-01T00:00:03.000000Z")).unwrap();
        repo.append(&rec("A", "B", "early", "2024-01-01T00:00:01.000000Z")).unwrap();
        repo.append(&rec("B", "A", "mid", "2024-01-01T00:00:02.000000Z")).unwrap();

        let texts: Vec<_> = repo
            .history_for("A", 100)
            .unwrap()
            .into_iter()
            .map(|m| m.record.text)
            .collect();
        assert_eq!(texts, ["early", "mid", "late"]);
    }

    #[test]
    fn history_respects_limit() {
        let repo = repo();
        for i in 0..120 {
            repo.append(&rec("A", "B", &format!("m{i}"), &format!("T{i:04}"))).unwrap();
        }
        let history = repo.history_for("B", 100).unwrap();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].record.text, "m0");
        assert!(history.windows(2).all(|w| w[0].record.timestamp <= w[1].record.timestamp));
    }

    #[test]
    fn stored_message_serializes_with_string_id() {
        let msg = StoredMessage {
            id: 7,
            record: rec("A", "B", "hi", "T"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["_id"], "7");
        assert_eq!(json["from"], "A");
        assert_eq!(json["to"], "B");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["timestamp"], "T");
    }
}
