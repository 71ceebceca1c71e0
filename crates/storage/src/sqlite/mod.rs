use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::error::{
    CreateSqliteDirectorySnafu, InvalidArgumentSnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageError,
    StorageResult,
};
use super::ids::{MessageId, RoomId};
use super::types::{MessageRecord, MessageRole, NewMessage, RoomRecord};
use super::{MessageStore, RoomStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        // Bootstrap only; store calls open their own connections.
        pool.close().await;

        tracing::debug!(database_url = %database_url, "sqlite chat store ready");
        Ok(Self { database_url })
    }

    /// Blocking variant of [`SqliteStorage::open`] for callers outside an async runtime.
    pub fn open_blocking(database_location: &str) -> StorageResult<Self> {
        let location = database_location.to_string();
        run_on_worker("sqlite-open", async move { Self::open(&location).await })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        run_on_worker(stage, op)
    }
}

// Store traits are sync, so each call executes on a dedicated worker thread
// with its own current-thread runtime to avoid nested-runtime blocking panics.
fn run_on_worker<T, F>(stage: &'static str, op: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: Future<Output = StorageResult<T>> + Send + 'static,
{
    let worker = std::thread::Builder::new()
        .name(format!("sqlite-store-{stage}"))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context(SqliteRuntimeInitSnafu {
                    stage: "sqlite-store-runtime-build",
                })?;
            runtime.block_on(op)
        })
        .context(SqliteThreadSpawnSnafu {
            stage: "sqlite-store-spawn-worker",
        })?;

    match worker.join() {
        Ok(result) => result,
        Err(_) => InvariantViolationSnafu {
            stage,
            details: "sqlite storage worker thread panicked".to_string(),
        }
        .fail(),
    }
}

impl RoomStore for SqliteStorage {
    fn create_room(&self, name: &str) -> StorageResult<RoomRecord> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return InvalidArgumentSnafu {
                stage: "room-create-validate",
                argument: "name",
                details: "room name cannot be empty".to_string(),
            }
            .fail();
        }

        let database_url = self.database_url.clone();
        self.run_db_call("room-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "room-create-connect").await?;
            let room_id = RoomId::new_v4();

            let created_at = sqlx::query_scalar::<_, i64>(
                "INSERT INTO chat_rooms (room_id, room_name, created_at) \
                 VALUES (?, ?, ?) RETURNING created_at",
            )
            .bind(room_id.to_string())
            .bind(name.clone())
            .bind(unix_timestamp_micros())
            .fetch_one(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "room-create-insert",
            })?;

            tracing::debug!(room_id = %room_id, room_name = %name, "created chat room");
            Ok(RoomRecord {
                room_id,
                name,
                created_at_unix_micros: i64_to_u64(created_at, "room-create-created-at")?,
            })
        })
    }

    fn get_room(&self, room_id: RoomId) -> StorageResult<Option<RoomRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("room-get", async move {
            let mut connection = connect_store_connection(&database_url, "room-get-connect").await?;
            let row = sqlx::query_as::<_, RoomRow>(
                "SELECT room_id, room_name, created_at FROM chat_rooms WHERE room_id = ?",
            )
            .bind(room_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "room-get-query",
            })?;

            row.map(room_row_to_record).transpose()
        })
    }

    fn list_rooms(&self) -> StorageResult<Vec<RoomRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("room-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "room-list-connect").await?;
            let rows = sqlx::query_as::<_, RoomRow>(
                "SELECT room_id, room_name, created_at FROM chat_rooms \
                 ORDER BY created_at DESC, rowid DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "room-list-query",
            })?;

            rows.into_iter().map(room_row_to_record).collect()
        })
    }

    fn delete_room(&self, room_id: RoomId) -> StorageResult<bool> {
        let database_url = self.database_url.clone();
        self.run_db_call("room-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "room-delete-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "room-delete-begin",
            })?;

            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT 1 FROM chat_rooms WHERE room_id = ? LIMIT 1",
            )
            .bind(room_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "room-delete-exists",
            })?
            .is_some();

            if !exists {
                tx.rollback().await.context(SqliteQuerySnafu {
                    stage: "room-delete-rollback",
                })?;
                return Ok(false);
            }

            // Messages go first so the foreign key never points at a missing room.
            let deleted_messages = sqlx::query("DELETE FROM messages WHERE room_id = ?")
                .bind(room_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "room-delete-messages",
                })?
                .rows_affected();

            sqlx::query("DELETE FROM chat_rooms WHERE room_id = ?")
                .bind(room_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "room-delete-room",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "room-delete-commit",
            })?;

            tracing::debug!(room_id = %room_id, deleted_messages, "deleted chat room");
            Ok(true)
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(&self, room_id: RoomId, input: NewMessage) -> StorageResult<MessageRecord> {
        if input.content.trim().is_empty() {
            return InvalidArgumentSnafu {
                stage: "message-append-validate",
                argument: "content",
                details: "message content cannot be empty".to_string(),
            }
            .fail();
        }

        let database_url = self.database_url.clone();
        self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            let role_text = input.role.as_str().to_string();

            // Single statement: the room check, the monotonic timestamp, and the insert
            // are one atomic step, so a row is never partially visible and timestamps never tie.
            let inserted = sqlx::query_as::<_, InsertedMessageRow>(
                "INSERT INTO messages (room_id, role, content, model_tag, timestamp) \
                 SELECT ?, ?, ?, ?, MAX(?, COALESCE((SELECT MAX(timestamp) FROM messages), 0) + 1) \
                 WHERE EXISTS (SELECT 1 FROM chat_rooms WHERE room_id = ?) \
                 RETURNING id, timestamp",
            )
            .bind(room_id.to_string())
            .bind(role_text)
            .bind(input.content.clone())
            .bind(input.model_tag.clone())
            .bind(unix_timestamp_micros())
            .bind(room_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            let Some(inserted) = inserted else {
                return NotFoundSnafu {
                    stage: "message-append-room-missing",
                    entity: "room",
                    id: room_id.to_string(),
                }
                .fail();
            };

            Ok(MessageRecord {
                id: MessageId::new(inserted.id),
                room_id,
                role: input.role,
                content: input.content,
                model_tag: input.model_tag,
                timestamp_unix_micros: i64_to_u64(inserted.timestamp, "message-append-timestamp")?,
            })
        })
    }

    fn list_messages(&self, room_id: RoomId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-list-connect").await?;
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, room_id, role, content, model_tag, timestamp FROM messages \
                 WHERE room_id = ? ORDER BY timestamp ASC, id ASC",
            )
            .bind(room_id.to_string())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn delete_all_messages(&self, room_id: RoomId) -> StorageResult<u64> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-delete-all", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-delete-all-connect").await?;
            let result = sqlx::query("DELETE FROM messages WHERE room_id = ?")
                .bind(room_id.to_string())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-all-apply",
                })?;

            Ok(result.rows_affected())
        })
    }

    fn delete_non_system_messages(&self, room_id: RoomId) -> StorageResult<u64> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-delete-non-system", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-delete-non-system-connect").await?;
            let result = sqlx::query(
                "DELETE FROM messages WHERE room_id = ? AND role IN ('human', 'assistant')",
            )
            .bind(room_id.to_string())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-delete-non-system-apply",
            })?;

            Ok(result.rows_affected())
        })
    }

    fn count_messages(&self, room_id: RoomId) -> StorageResult<u64> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-count", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-count-connect").await?;
            let count =
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE room_id = ?")
                    .bind(room_id.to_string())
                    .fetch_one(&mut connection)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-count-query",
                    })?;

            i64_to_u64(count, "message-count-value")
        })
    }
}

#[derive(Debug, FromRow)]
struct RoomRow {
    room_id: String,
    room_name: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    room_id: String,
    role: String,
    content: String,
    model_tag: String,
    timestamp: i64,
}

#[derive(Debug, FromRow)]
struct InsertedMessageRow {
    id: i64,
    timestamp: i64,
}

fn room_row_to_record(row: RoomRow) -> StorageResult<RoomRecord> {
    Ok(RoomRecord {
        room_id: RoomId::parse(&row.room_id)?,
        name: row.room_name,
        created_at_unix_micros: i64_to_u64(row.created_at, "room-row-created-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::new(row.id),
        room_id: RoomId::parse(&row.room_id)?,
        role: MessageRole::parse(&row.role),
        content: row.content,
        model_tag: row.model_tag,
        timestamp_unix_micros: i64_to_u64(row.timestamp, "message-row-timestamp")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn unix_timestamp_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_micros() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}
