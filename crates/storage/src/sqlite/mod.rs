use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::ConversationStore;
use super::error::{
    CreateSqliteDirectorySnafu, InMemoryDatabaseSnafu, InvariantViolationSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageResult,
};
use super::ids::UserId;
use super::types::{ConversationBlob, unix_timestamp_seconds};

/// File-backed conversation store. Every call opens its own connection, so an
/// in-memory database would vanish between calls and is refused by [`Self::open`].
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        if is_in_memory(database_location) {
            return InMemoryDatabaseSnafu {
                stage: "sqlite-open-check-location",
                database_location,
            }
            .fail();
        }
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
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

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        pool.close().await;
        tracing::info!(database_url = %database_url, "opened sqlite conversation store");
        Ok(Self { database_url })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
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
}

impl ConversationStore for SqliteStorage {
    fn load_conversation(&self, user_id: &UserId) -> StorageResult<Option<ConversationBlob>> {
        let database_url = self.database_url.clone();
        let user_id = user_id.clone();
        self.run_db_call("conversation-load", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-load-connect").await?;
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT user_id, payload, updated_at FROM conversations WHERE user_id = ?",
            )
            .bind(user_id.as_str())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-load-query",
            })?;

            row.map(conversation_row_to_blob).transpose()
        })
    }

    fn save_conversation(
        &self,
        user_id: &UserId,
        payload: &str,
    ) -> StorageResult<ConversationBlob> {
        let database_url = self.database_url.clone();
        let user_id = user_id.clone();
        let payload = payload.to_string();
        self.run_db_call("conversation-save", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-save-connect").await?;
            let now = unix_timestamp_seconds();
            let now_sql = u64_to_i64(now, "conversation-save-updated-at")?;

            sqlx::query(
                "INSERT INTO conversations (user_id, payload, created_at, updated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(user_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            )
            .bind(user_id.as_str())
            .bind(payload.as_str())
            .bind(now_sql)
            .bind(now_sql)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-save-upsert",
            })?;

            Ok(ConversationBlob {
                user_id,
                payload,
                updated_at_unix_seconds: now,
            })
        })
    }

    fn clear_conversation(&self, user_id: &UserId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let user_id = user_id.clone();
        self.run_db_call("conversation-clear", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-clear-connect").await?;
            let result = sqlx::query("DELETE FROM conversations WHERE user_id = ?")
                .bind(user_id.as_str())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-clear-delete",
                })?;

            tracing::debug!(
                user_id = %user_id,
                rows = result.rows_affected(),
                "cleared stored conversation"
            );
            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    user_id: String,
    payload: String,
    updated_at: i64,
}

fn conversation_row_to_blob(row: ConversationRow) -> StorageResult<ConversationBlob> {
    Ok(ConversationBlob {
        user_id: UserId::parse(&row.user_id)?,
        payload: row.payload,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
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

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    u64::try_from(value).map_err(|_| {
        InvariantViolationSnafu {
            stage,
            details: format!("negative timestamp {value}"),
        }
        .build()
    })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| {
        InvariantViolationSnafu {
            stage,
            details: format!("timestamp {value} exceeds sqlite integer range"),
        }
        .build()
    })
}

fn is_in_memory(database_location: &str) -> bool {
    let location = database_location
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    location == ":memory:" || location.contains("mode=memory")
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn database_urls_are_normalized() {
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(
            normalize_database_url("/tmp/parley/conversations.db"),
            "sqlite:///tmp/parley/conversations.db"
        );
    }

    #[tokio::test]
    async fn in_memory_locations_are_refused() {
        for location in [":memory:", "sqlite::memory:", "sqlite:file:parley?mode=memory"] {
            let result = SqliteStorage::open(location).await;
            assert!(
                matches!(result, Err(StorageError::InMemoryDatabase { .. })),
                "{location} should be refused"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_load_clear_roundtrip() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("nested/conversations.db");
        let storage = SqliteStorage::open(path.to_str().expect("utf8 path"))
            .await
            .expect("open");

        let alice = UserId::parse("alice").expect("valid");
        let bob = UserId::parse("bob").expect("valid");

        assert!(storage.load_conversation(&alice).expect("load").is_none());

        storage.save_conversation(&alice, "first").expect("save");
        storage.save_conversation(&alice, "second").expect("overwrite");
        storage.save_conversation(&bob, "bob's").expect("save");

        let loaded = storage
            .load_conversation(&alice)
            .expect("load")
            .expect("present");
        assert_eq!(loaded.payload, "second");
        assert_eq!(loaded.user_id, alice);

        storage.clear_conversation(&alice).expect("clear");
        assert!(storage.load_conversation(&alice).expect("load").is_none());
        assert_eq!(
            storage
                .load_conversation(&bob)
                .expect("load")
                .map(|blob| blob.payload),
            Some("bob's".to_string())
        );
    }
}
