//! Conversation Store
//!
//! Durable record of discussions and their messages in SQLite.
//!
//! Every operation opens its own connection and closes it when done. There
//! is no connection shared across requests, so a slow request never holds a
//! lock another request is waiting on. Message order is the order of the
//! auto-incrementing `message.id`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Discussion identifier (auto-incremented by the database)
pub type DiscussionId = i64;

/// Title given to discussions created implicitly
pub const DEFAULT_TITLE: &str = "untitled";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS discussion (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT
);
CREATE TABLE IF NOT EXISTS message (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    discussion_id INTEGER NOT NULL,
    FOREIGN KEY (discussion_id) REFERENCES discussion(id)
);
";

/// Errors from the conversation store
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite reported an error
    #[error("database {path} failed during {operation}: {source}")]
    Sqlite {
        /// Database file
        path: PathBuf,
        /// What the store was doing
        operation: &'static str,
        /// Underlying error
        #[source]
        source: rusqlite::Error,
    },
    /// The referenced discussion does not exist
    #[error("discussion {0} does not exist")]
    DiscussionNotFound(DiscussionId),
}

/// Who wrote a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The person chatting
    User,
    /// The generation engine
    Assistant,
}

impl Sender {
    /// Stored and serialized name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored sender name that is neither "user" nor "assistant"
#[derive(Debug, Error)]
#[error("unknown sender {0:?}")]
pub struct ParseSenderError(String);

impl FromStr for Sender {
    type Err = ParseSenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(ParseSenderError(other.to_string())),
        }
    }
}

impl ToSql for Sender {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Sender {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A conversation thread
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discussion {
    /// Identifier
    pub id: DiscussionId,
    /// Title (may be absent in databases written by older versions)
    pub title: Option<String>,
}

/// One turn in a discussion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier, increasing in insertion order
    pub id: i64,
    /// Who wrote it
    pub sender: Sender,
    /// Text
    pub content: String,
    /// Owning discussion
    pub discussion_id: DiscussionId,
}

/// Discussion as it appears in an export
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDiscussion {
    /// Discussion identifier
    pub id: DiscussionId,
    /// Messages in conversation order
    pub messages: Vec<ExportedMessage>,
}

/// Message as it appears in an export
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedMessage {
    /// Who wrote it
    pub sender: Sender,
    /// Text
    pub content: String,
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get("id")?,
        sender: row.get("sender")?,
        content: row.get("content")?,
        discussion_id: row.get("discussion_id")?,
    })
}

fn row_to_discussion(row: &Row) -> rusqlite::Result<Discussion> {
    Ok(Discussion {
        id: row.get("id")?,
        title: row.get("title")?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// SQLite-backed conversation store
#[derive(Clone, Debug)]
pub struct ConversationStore {
    path: PathBuf,
}

impl ConversationStore {
    /// Open (creating if needed) the database at `path` and ensure the schema
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        store.with_conn("create schema", |conn| conn.execute_batch(SCHEMA))?;
        info!(path = %store.path.display(), "Conversation store ready");
        Ok(store)
    }

    /// Database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a fresh connection, closed on return
    fn with_conn<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let wrap = |source| StoreError::Sqlite {
            path: self.path.clone(),
            operation,
            source,
        };

        let mut conn = Connection::open(&self.path).map_err(wrap)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(wrap)?;
        f(&mut conn).map_err(wrap)
    }

    /// Create a discussion, returning its id
    pub fn create_discussion(&self, title: &str) -> Result<DiscussionId, StoreError> {
        let id = self.with_conn("create discussion", |conn| {
            conn.execute("INSERT INTO discussion (title) VALUES (?1)", params![title])?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(discussion_id = id, title, "Created discussion");
        Ok(id)
    }

    /// Append a message to a discussion, returning the message id
    pub fn append_message(
        &self,
        discussion_id: DiscussionId,
        sender: Sender,
        content: &str,
    ) -> Result<i64, StoreError> {
        let result = self.with_conn("append message", |conn| {
            conn.execute(
                "INSERT INTO message (sender, content, discussion_id) VALUES (?1, ?2, ?3)",
                params![sender, content, discussion_id],
            )?;
            Ok(conn.last_insert_rowid())
        });

        match result {
            Err(StoreError::Sqlite { ref source, .. }) if is_constraint_violation(source) => {
                Err(StoreError::DiscussionNotFound(discussion_id))
            }
            other => other,
        }
    }

    /// Messages of a discussion in conversation order
    pub fn list_messages(&self, discussion_id: DiscussionId) -> Result<Vec<Message>, StoreError> {
        self.with_conn("list messages", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender, content, discussion_id FROM message
                 WHERE discussion_id = ?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![discussion_id], row_to_message)?;
            rows.collect()
        })
    }

    /// All discussions, oldest first
    pub fn list_discussions(&self) -> Result<Vec<Discussion>, StoreError> {
        self.with_conn("list discussions", |conn| {
            let mut stmt = conn.prepare("SELECT id, title FROM discussion ORDER BY id")?;
            let rows = stmt.query_map([], row_to_discussion)?;
            rows.collect()
        })
    }

    /// Most recently created discussion
    pub fn latest_discussion_id(&self) -> Result<Option<DiscussionId>, StoreError> {
        self.with_conn("find latest discussion", |conn| {
            conn.query_row("SELECT MAX(id) FROM discussion", [], |row| row.get(0))
        })
    }

    /// Whether the most recently created discussion holds at least one message
    pub fn has_any_message_in_latest_discussion(&self) -> Result<bool, StoreError> {
        self.with_conn("check latest discussion", |conn| {
            conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM message
                    WHERE discussion_id = (SELECT MAX(id) FROM discussion)
                 )",
                [],
                |row| row.get(0),
            )
        })
    }

    /// Delete a discussion and its messages; returns whether it existed
    pub fn delete_discussion(&self, discussion_id: DiscussionId) -> Result<bool, StoreError> {
        let deleted = self.with_conn("delete discussion", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM message WHERE discussion_id = ?1",
                params![discussion_id],
            )?;
            let deleted = tx.execute("DELETE FROM discussion WHERE id = ?1", params![discussion_id])?;
            tx.commit()?;
            Ok(deleted > 0)
        })?;
        debug!(discussion_id, deleted, "Deleted discussion");
        Ok(deleted)
    }

    /// Delete every discussion and message
    pub fn delete_all(&self) -> Result<(), StoreError> {
        self.with_conn("delete all discussions", |conn| {
            conn.execute_batch("BEGIN; DELETE FROM message; DELETE FROM discussion; COMMIT;")
        })?;
        info!("Deleted all discussions");
        Ok(())
    }

    /// Every discussion with its messages
    pub fn export_all(&self) -> Result<Vec<ExportedDiscussion>, StoreError> {
        self.with_conn("export", |conn| {
            let ids: Vec<DiscussionId> = {
                let mut stmt = conn.prepare("SELECT id FROM discussion ORDER BY id")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut stmt = conn.prepare(
                "SELECT sender, content FROM message WHERE discussion_id = ?1 ORDER BY id",
            )?;
            ids.into_iter()
                .map(|id| -> rusqlite::Result<ExportedDiscussion> {
                    let messages = stmt
                        .query_map(params![id], |row| {
                            Ok(ExportedMessage {
                                sender: row.get("sender")?,
                                content: row.get("content")?,
                            })
                        })?
                        .collect::<rusqlite::Result<_>>()?;
                    Ok(ExportedDiscussion { id, messages })
                })
                .collect()
        })
    }

    /// Whether a discussion with this id exists
    pub fn discussion_exists(&self, discussion_id: DiscussionId) -> Result<bool, StoreError> {
        self.with_conn("check discussion", |conn| {
            conn.query_row(
                "SELECT id FROM discussion WHERE id = ?1",
                params![discussion_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|found| found.is_some())
        })
    }
}
