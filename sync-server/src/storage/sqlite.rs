//! SQLite storage backend for the sync server.

use super::{FullStateOp, SnapshotBlob, SnapshotCoverage};
use crate::error::{StorageError, StorageResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::sqlite::SqliteExecutor;
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use sync_core::ValidatedOp;
use sync_types::{OpKind, Seq, ServerOperation, UserId, VectorClock};

/// SQLite-backed operation log.
///
/// Uses WAL mode for concurrent reads/writes. SQLite transactions are
/// serializable, which is what the double conflict check in the upload
/// coordinator leans on.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a store at the given database path.
    pub async fn new(path: &Path) -> StorageResult<Self> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // A single connection: an in-memory database exists per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> StorageResult<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(StorageError::Database)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_sync_state (
                user_id INTEGER PRIMARY KEY,
                last_seq INTEGER NOT NULL DEFAULT 0,
                last_snapshot_seq INTEGER NOT NULL DEFAULT 0,
                snapshot_at INTEGER,
                snapshot_data BLOB,
                storage_used_bytes INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                user_id INTEGER NOT NULL,
                id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                op_kind TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT,
                entity_ids TEXT,
                payload TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                client_ts INTEGER NOT NULL,
                is_payload_encrypted INTEGER NOT NULL DEFAULT 0,
                received_at INTEGER NOT NULL,
                server_seq INTEGER NOT NULL,
                PRIMARY KEY (user_id, id),
                UNIQUE (user_id, server_seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_devices (
                user_id INTEGER NOT NULL,
                client_id TEXT NOT NULL,
                last_seen_at INTEGER NOT NULL,
                last_acked_seq INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, client_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_operations_entity \
             ON operations(user_id, entity_type, entity_id, server_seq)",
            "CREATE INDEX IF NOT EXISTS idx_operations_seq \
             ON operations(user_id, server_seq)",
            "CREATE INDEX IF NOT EXISTS idx_operations_kind \
             ON operations(user_id, op_kind, server_seq)",
            "CREATE INDEX IF NOT EXISTS idx_operations_received \
             ON operations(user_id, received_at)",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(StorageError::Database)?;
        }

        Ok(())
    }

    // === Sync state ===

    /// Make sure the user's sync-state row exists (no-op when it does).
    pub async fn ensure_sync_state<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_sync_state (user_id, last_seq)
            VALUES (?1, 0)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user.value())
        .execute(exec)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    /// The user's sequence high-water mark (0 when the user has no state).
    pub async fn last_seq<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
    ) -> StorageResult<Seq> {
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT last_seq FROM user_sync_state WHERE user_id = ?1")
                .bind(user.value())
                .fetch_optional(exec)
                .await
                .map_err(StorageError::Database)?;
        Ok(Seq::new(seq.unwrap_or(0) as u64))
    }

    /// Atomically increment and return the user's next sequence number.
    ///
    /// This UPDATE locks the user's state row for the rest of the
    /// transaction, serializing concurrent allocators for the same user.
    pub async fn allocate_seq<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
    ) -> StorageResult<Seq> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            UPDATE user_sync_state
            SET last_seq = last_seq + 1
            WHERE user_id = ?1
            RETURNING last_seq
            "#,
        )
        .bind(user.value())
        .fetch_one(exec)
        .await
        .map_err(StorageError::Database)?;
        Ok(Seq::new(seq as u64))
    }

    // === Operations ===

    /// The latest stored operation's clock and client for one entity.
    pub async fn latest_op_for_entity<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        entity_type: &str,
        entity_id: &str,
    ) -> StorageResult<Option<(VectorClock, String)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT vector_clock, client_id FROM operations
            WHERE user_id = ?1 AND entity_type = ?2 AND entity_id = ?3
            ORDER BY server_seq DESC
            LIMIT 1
            "#,
        )
        .bind(user.value())
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(exec)
        .await
        .map_err(StorageError::Database)?;

        match row {
            Some((clock_json, client_id)) => {
                let clock = serde_json::from_str(&clock_json)
                    .map_err(|e| StorageError::CorruptRow(format!("vector_clock: {e}")))?;
                Ok(Some((clock, client_id)))
            }
            None => Ok(None),
        }
    }

    /// Whether an operation with this id is already stored for the user.
    pub async fn op_exists<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        op_id: &str,
    ) -> StorageResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM operations WHERE user_id = ?1 AND id = ?2")
                .bind(user.value())
                .bind(op_id)
                .fetch_optional(exec)
                .await
                .map_err(StorageError::Database)?;
        Ok(found.is_some())
    }

    /// Persist a validated operation under its allocated sequence.
    ///
    /// A primary-key collision maps to [`StorageError::DuplicateOperation`]
    /// so a racing duplicate rejects one operation, not the whole batch.
    pub async fn insert_op<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        validated: &ValidatedOp,
        server_seq: Seq,
        received_at: i64,
    ) -> StorageResult<()> {
        let op = &validated.op;
        let entity_ids_json = match &op.entity_ids {
            Some(ids) => Some(
                serde_json::to_string(ids)
                    .map_err(|e| StorageError::CorruptRow(format!("entity_ids: {e}")))?,
            ),
            None => None,
        };
        let payload_json = op.payload.to_string();
        let clock_json = serde_json::to_string(&validated.clock)
            .map_err(|e| StorageError::CorruptRow(format!("vector_clock: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO operations (
                user_id, id, client_id, action_type, op_kind, entity_type,
                entity_id, entity_ids, payload, vector_clock, schema_version,
                client_ts, is_payload_encrypted, received_at, server_seq
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(user.value())
        .bind(&op.id)
        .bind(&op.client_id)
        .bind(&op.action_type)
        .bind(op.op_kind.as_str())
        .bind(&op.entity_type)
        .bind(&op.entity_id)
        .bind(entity_ids_json)
        .bind(payload_json)
        .bind(clock_json)
        .bind(op.schema_version as i64)
        .bind(op.timestamp)
        .bind(op.is_payload_encrypted)
        .bind(received_at)
        .bind(server_seq.value() as i64)
        .execute(exec)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db)
                if db.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                StorageError::DuplicateOperation {
                    op_id: op.id.clone(),
                }
            }
            _ => StorageError::Database(e),
        })?;
        Ok(())
    }

    /// Operations after `after`, ascending, up to `limit` rows.
    pub async fn ops_after<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        after: Seq,
        exclude_client: Option<&str>,
        limit: u32,
    ) -> StorageResult<Vec<ServerOperation>> {
        let rows: Vec<OperationRow> = match exclude_client {
            Some(exclude) => {
                sqlx::query_as(
                    r#"
                    SELECT server_seq, id, client_id, action_type, op_kind,
                           entity_type, entity_id, entity_ids, payload,
                           vector_clock, schema_version, client_ts,
                           is_payload_encrypted, received_at
                    FROM operations
                    WHERE user_id = ?1 AND server_seq > ?2 AND client_id != ?3
                    ORDER BY server_seq ASC
                    LIMIT ?4
                    "#,
                )
                .bind(user.value())
                .bind(after.value() as i64)
                .bind(exclude)
                .bind(limit as i64)
                .fetch_all(exec)
                .await
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT server_seq, id, client_id, action_type, op_kind,
                           entity_type, entity_id, entity_ids, payload,
                           vector_clock, schema_version, client_ts,
                           is_payload_encrypted, received_at
                    FROM operations
                    WHERE user_id = ?1 AND server_seq > ?2
                    ORDER BY server_seq ASC
                    LIMIT ?3
                    "#,
                )
                .bind(user.value())
                .bind(after.value() as i64)
                .bind(limit as i64)
                .fetch_all(exec)
                .await
            }
        }
        .map_err(StorageError::Database)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Operations with `after < server_seq <= upto`, ascending.
    pub async fn ops_in_range<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        after: Seq,
        upto: Seq,
        limit: u32,
    ) -> StorageResult<Vec<ServerOperation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(
            r#"
            SELECT server_seq, id, client_id, action_type, op_kind,
                   entity_type, entity_id, entity_ids, payload,
                   vector_clock, schema_version, client_ts,
                   is_payload_encrypted, received_at
            FROM operations
            WHERE user_id = ?1 AND server_seq > ?2 AND server_seq <= ?3
            ORDER BY server_seq ASC
            LIMIT ?4
            "#,
        )
        .bind(user.value())
        .bind(after.value() as i64)
        .bind(upto.value() as i64)
        .bind(limit as i64)
        .fetch_all(exec)
        .await
        .map_err(StorageError::Database)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// The lowest retained sequence for a user, if any operations remain.
    pub async fn min_seq<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
    ) -> StorageResult<Option<Seq>> {
        let min: Option<i64> =
            sqlx::query_scalar("SELECT MIN(server_seq) FROM operations WHERE user_id = ?1")
                .bind(user.value())
                .fetch_one(exec)
                .await
                .map_err(StorageError::Database)?;
        Ok(min.map(|v| Seq::new(v as u64)))
    }

    /// The highest full-state operation sequence, if any exists.
    pub async fn latest_full_state_seq<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
    ) -> StorageResult<Option<Seq>> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(server_seq) FROM operations
            WHERE user_id = ?1
              AND op_kind IN ('SYNC_IMPORT', 'BACKUP_IMPORT', 'REPAIR')
            "#,
        )
        .bind(user.value())
        .fetch_one(exec)
        .await
        .map_err(StorageError::Database)?;
        Ok(max.map(|v| Seq::new(v as u64)))
    }

    /// Pointwise-maximum merge of all clocks up to and including `through`.
    pub async fn merged_clock_through<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        through: Seq,
    ) -> StorageResult<VectorClock> {
        let clocks: Vec<String> = sqlx::query_scalar(
            "SELECT vector_clock FROM operations WHERE user_id = ?1 AND server_seq <= ?2",
        )
        .bind(user.value())
        .bind(through.value() as i64)
        .fetch_all(exec)
        .await
        .map_err(StorageError::Database)?;

        let mut merged = VectorClock::new();
        for clock_json in clocks {
            let clock: VectorClock = serde_json::from_str(&clock_json)
                .map_err(|e| StorageError::CorruptRow(format!("vector_clock: {e}")))?;
            merged.merge_max(&clock);
        }
        Ok(merged)
    }

    /// Count encrypted operations with `after < server_seq <= upto`.
    pub async fn count_encrypted_in_range<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        after: Seq,
        upto: Seq,
    ) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM operations
            WHERE user_id = ?1 AND server_seq > ?2 AND server_seq <= ?3
              AND is_payload_encrypted = 1
            "#,
        )
        .bind(user.value())
        .bind(after.value() as i64)
        .bind(upto.value() as i64)
        .fetch_one(exec)
        .await
        .map_err(StorageError::Database)?;
        Ok(count as u64)
    }

    /// Full-state operations, newest first.
    pub async fn full_state_ops<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        limit: u32,
    ) -> StorageResult<Vec<FullStateOp>> {
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT server_seq, op_kind, client_id, client_ts FROM operations
            WHERE user_id = ?1
              AND op_kind IN ('SYNC_IMPORT', 'BACKUP_IMPORT', 'REPAIR')
            ORDER BY server_seq DESC
            LIMIT ?2
            "#,
        )
        .bind(user.value())
        .bind(limit as i64)
        .fetch_all(exec)
        .await
        .map_err(StorageError::Database)?;

        rows.into_iter()
            .map(|(seq, kind, client_id, timestamp)| {
                Ok(FullStateOp {
                    server_seq: Seq::new(seq as u64),
                    kind: kind
                        .parse::<OpKind>()
                        .map_err(|e| StorageError::CorruptRow(e.to_string()))?,
                    client_id,
                    timestamp,
                })
            })
            .collect()
    }

    /// Sequences of full-state operations, oldest first.
    pub async fn full_state_seqs_asc<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
    ) -> StorageResult<Vec<Seq>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT server_seq FROM operations
            WHERE user_id = ?1
              AND op_kind IN ('SYNC_IMPORT', 'BACKUP_IMPORT', 'REPAIR')
            ORDER BY server_seq ASC
            "#,
        )
        .bind(user.value())
        .fetch_all(exec)
        .await
        .map_err(StorageError::Database)?;
        Ok(rows.into_iter().map(|v| Seq::new(v as u64)).collect())
    }

    // === Retention / compaction deletes ===

    /// Delete operations with `server_seq <= upto` received before `cutoff`.
    pub async fn delete_covered_ops(
        &self,
        user: UserId,
        upto: Seq,
        received_before: i64,
    ) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM operations
            WHERE user_id = ?1 AND server_seq <= ?2 AND received_at < ?3
            "#,
        )
        .bind(user.value())
        .bind(upto.value() as i64)
        .bind(received_before)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(result.rows_affected())
    }

    /// Delete operations with `server_seq <= upto` (quota compaction).
    pub async fn delete_ops_up_to(&self, user: UserId, upto: Seq) -> StorageResult<u64> {
        let result =
            sqlx::query("DELETE FROM operations WHERE user_id = ?1 AND server_seq <= ?2")
                .bind(user.value())
                .bind(upto.value() as i64)
                .execute(&self.pool)
                .await
                .map_err(StorageError::Database)?;
        Ok(result.rows_affected())
    }

    /// Delete operations strictly before `seq` (quota compaction, keeping
    /// the restore point at `seq` itself).
    pub async fn delete_ops_before(&self, user: UserId, seq: Seq) -> StorageResult<u64> {
        let result =
            sqlx::query("DELETE FROM operations WHERE user_id = ?1 AND server_seq < ?2")
                .bind(user.value())
                .bind(seq.value() as i64)
                .execute(&self.pool)
                .await
                .map_err(StorageError::Database)?;
        Ok(result.rows_affected())
    }

    /// Users whose sync state carries a durable snapshot.
    pub async fn snapshot_coverage(&self) -> StorageResult<Vec<SnapshotCoverage>> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, last_snapshot_seq, snapshot_at FROM user_sync_state
            WHERE last_snapshot_seq > 0 AND snapshot_at IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(rows
            .into_iter()
            .map(|(user_id, seq, at)| SnapshotCoverage {
                user_id: UserId::new(user_id),
                last_snapshot_seq: Seq::new(seq as u64),
                snapshot_at: at,
            })
            .collect())
    }

    /// Delete devices not seen since `cutoff`.
    pub async fn delete_stale_devices(&self, cutoff: i64) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM sync_devices WHERE last_seen_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(result.rows_affected())
    }

    // === Snapshot cache ===

    /// Load the cached snapshot blob, if one exists.
    pub async fn load_snapshot_blob<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
    ) -> StorageResult<Option<SnapshotBlob>> {
        let row: Option<(Option<Vec<u8>>, i64, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT snapshot_data, last_snapshot_seq, snapshot_at
            FROM user_sync_state WHERE user_id = ?1
            "#,
        )
        .bind(user.value())
        .fetch_optional(exec)
        .await
        .map_err(StorageError::Database)?;

        Ok(row.and_then(|(data, seq, at)| {
            data.map(|data| SnapshotBlob {
                data,
                seq: Seq::new(seq as u64),
                generated_at: at.unwrap_or(0),
            })
        }))
    }

    /// Store (replace) the cached snapshot blob.
    pub async fn store_snapshot_blob<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        data: &[u8],
        seq: Seq,
        generated_at: i64,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE user_sync_state
            SET snapshot_data = ?2, last_snapshot_seq = ?3, snapshot_at = ?4
            WHERE user_id = ?1
            "#,
        )
        .bind(user.value())
        .bind(data)
        .bind(seq.value() as i64)
        .bind(generated_at)
        .execute(exec)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    /// Drop the cached snapshot (used when compaction deletes its basis).
    pub async fn clear_snapshot_blob(&self, user: UserId) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE user_sync_state
            SET snapshot_data = NULL, last_snapshot_seq = 0, snapshot_at = NULL
            WHERE user_id = ?1
            "#,
        )
        .bind(user.value())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    // === Storage accounting ===

    /// Bytes of payload currently stored for a user.
    pub async fn payload_bytes(&self, user: UserId) -> StorageResult<u64> {
        let size: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(LENGTH(payload)) FROM operations WHERE user_id = ?1",
        )
        .bind(user.value())
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(size.unwrap_or(0) as u64)
    }

    /// Persist a recomputed storage figure on the user's sync state.
    pub async fn set_storage_used(&self, user: UserId, bytes: u64) -> StorageResult<()> {
        self.ensure_sync_state(&self.pool, user).await?;
        sqlx::query("UPDATE user_sync_state SET storage_used_bytes = ?2 WHERE user_id = ?1")
            .bind(user.value())
            .bind(bytes as i64)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(())
    }

    /// The last persisted storage figure for a user.
    pub async fn storage_used(&self, user: UserId) -> StorageResult<u64> {
        let bytes: Option<i64> = sqlx::query_scalar(
            "SELECT storage_used_bytes FROM user_sync_state WHERE user_id = ?1",
        )
        .bind(user.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(bytes.unwrap_or(0) as u64)
    }

    // === Devices ===

    /// Record that a device checked in (creating the row when new).
    pub async fn upsert_device<'e>(
        &self,
        exec: impl SqliteExecutor<'e>,
        user: UserId,
        client_id: &str,
        now: i64,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_devices (user_id, client_id, last_seen_at, last_acked_seq, created_at)
            VALUES (?1, ?2, ?3, 0, ?3)
            ON CONFLICT(user_id, client_id) DO UPDATE SET last_seen_at = ?3
            "#,
        )
        .bind(user.value())
        .bind(client_id)
        .bind(now)
        .execute(exec)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    /// Record a device's acknowledged sequence. Returns false when the
    /// device is unknown.
    pub async fn record_device_ack(
        &self,
        user: UserId,
        client_id: &str,
        acked: Seq,
        now: i64,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_devices SET last_acked_seq = ?3, last_seen_at = ?4
            WHERE user_id = ?1 AND client_id = ?2
            "#,
        )
        .bind(user.value())
        .bind(client_id)
        .bind(acked.value() as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Devices seen after `seen_after`.
    pub async fn online_device_count(
        &self,
        user: UserId,
        seen_after: i64,
    ) -> StorageResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_devices WHERE user_id = ?1 AND last_seen_at > ?2",
        )
        .bind(user.value())
        .bind(seen_after)
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(count as u32)
    }

    /// The slowest device's acknowledged sequence, if any devices exist.
    pub async fn min_acked_seq(&self, user: UserId) -> StorageResult<Option<Seq>> {
        let min: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(last_acked_seq) FROM sync_devices WHERE user_id = ?1",
        )
        .bind(user.value())
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(min.map(|v| Seq::new(v as u64)))
    }
}

/// Internal row type for operation queries.
#[derive(sqlx::FromRow)]
struct OperationRow {
    server_seq: i64,
    id: String,
    client_id: String,
    action_type: String,
    op_kind: String,
    entity_type: String,
    entity_id: Option<String>,
    entity_ids: Option<String>,
    payload: String,
    vector_clock: String,
    schema_version: i64,
    client_ts: i64,
    is_payload_encrypted: bool,
    received_at: i64,
}

impl TryFrom<OperationRow> for ServerOperation {
    type Error = StorageError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let entity_ids = match row.entity_ids {
            Some(json) => Some(
                serde_json::from_str(&json)
                    .map_err(|e| StorageError::CorruptRow(format!("entity_ids: {e}")))?,
            ),
            None => None,
        };
        Ok(ServerOperation {
            server_seq: Seq::new(row.server_seq as u64),
            id: row.id,
            client_id: row.client_id,
            action_type: row.action_type,
            op_kind: row
                .op_kind
                .parse::<OpKind>()
                .map_err(|e| StorageError::CorruptRow(e.to_string()))?,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            entity_ids,
            payload: serde_json::from_str(&row.payload)
                .map_err(|e| StorageError::CorruptRow(format!("payload: {e}")))?,
            vector_clock: serde_json::from_str(&row.vector_clock)
                .map_err(|e| StorageError::CorruptRow(format!("vector_clock: {e}")))?,
            timestamp: row.client_ts,
            schema_version: row.schema_version as u32,
            is_payload_encrypted: row.is_payload_encrypted,
            received_at: row.received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::now_ms;
    use serde_json::json;
    use sync_core::validate::{validate, ValidationConfig};
    use sync_types::Operation;

    const USER: UserId = UserId::new(1);

    fn make_op(id: &str, client: &str, entity_id: &str, counter: u64) -> ValidatedOp {
        let op = Operation {
            id: id.to_string(),
            client_id: client.to_string(),
            action_type: "test".to_string(),
            op_kind: OpKind::Create,
            entity_type: "TASK".to_string(),
            entity_id: Some(entity_id.to_string()),
            entity_ids: None,
            payload: json!({"title": id}),
            vector_clock: json!({ client: counter }),
            timestamp: now_ms(),
            schema_version: 1,
            is_payload_encrypted: false,
        };
        validate(op, client, now_ms(), &ValidationConfig::default()).unwrap()
    }

    async fn store_one(store: &SqliteStore, validated: &ValidatedOp) -> Seq {
        let mut tx = store.begin().await.unwrap();
        store.ensure_sync_state(&mut *tx, USER).await.unwrap();
        let seq = store.allocate_seq(&mut *tx, USER).await.unwrap();
        store
            .insert_op(&mut *tx, USER, validated, seq, now_ms())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        seq
    }

    #[tokio::test]
    async fn allocate_seq_is_monotonic() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        store.ensure_sync_state(&mut *tx, USER).await.unwrap();
        let s1 = store.allocate_seq(&mut *tx, USER).await.unwrap();
        let s2 = store.allocate_seq(&mut *tx, USER).await.unwrap();
        let s3 = store.allocate_seq(&mut *tx, USER).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(s1.value(), 1);
        assert_eq!(s2.value(), 2);
        assert_eq!(s3.value(), 3);
        assert_eq!(store.last_seq(store.pool(), USER).await.unwrap(), s3);
    }

    #[tokio::test]
    async fn seqs_are_independent_per_user() {
        let store = SqliteStore::in_memory().await.unwrap();
        let other = UserId::new(2);
        let mut tx = store.begin().await.unwrap();
        store.ensure_sync_state(&mut *tx, USER).await.unwrap();
        store.ensure_sync_state(&mut *tx, other).await.unwrap();
        let a1 = store.allocate_seq(&mut *tx, USER).await.unwrap();
        let b1 = store.allocate_seq(&mut *tx, other).await.unwrap();
        let a2 = store.allocate_seq(&mut *tx, USER).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(a1.value(), 1);
        assert_eq!(b1.value(), 1);
        assert_eq!(a2.value(), 2);
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let store = SqliteStore::in_memory().await.unwrap();
        let validated = make_op("op-1", "client-a", "task-1", 1);
        let seq = store_one(&store, &validated).await;

        let ops = store
            .ops_after(store.pool(), USER, Seq::zero(), None, 100)
            .await
            .unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].server_seq, seq);
        assert_eq!(ops[0].id, "op-1");
        assert_eq!(ops[0].payload, json!({"title": "op-1"}));
        assert_eq!(ops[0].vector_clock.get("client-a"), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_maps_to_duplicate_error() {
        let store = SqliteStore::in_memory().await.unwrap();
        let validated = make_op("op-1", "client-a", "task-1", 1);
        store_one(&store, &validated).await;

        let mut tx = store.begin().await.unwrap();
        let seq = store.allocate_seq(&mut *tx, USER).await.unwrap();
        let err = store
            .insert_op(&mut *tx, USER, &validated, seq, now_ms())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::DuplicateOperation { op_id } if op_id == "op-1"
        ));
    }

    #[tokio::test]
    async fn op_exists_pre_check() {
        let store = SqliteStore::in_memory().await.unwrap();
        let validated = make_op("op-1", "client-a", "task-1", 1);
        store_one(&store, &validated).await;

        assert!(store.op_exists(store.pool(), USER, "op-1").await.unwrap());
        assert!(!store.op_exists(store.pool(), USER, "op-2").await.unwrap());
    }

    #[tokio::test]
    async fn latest_op_for_entity_returns_newest_clock() {
        let store = SqliteStore::in_memory().await.unwrap();
        store_one(&store, &make_op("op-1", "client-a", "task-1", 1)).await;
        store_one(&store, &make_op("op-2", "client-a", "task-1", 2)).await;
        store_one(&store, &make_op("op-3", "client-a", "task-2", 1)).await;

        let (clock, client) = store
            .latest_op_for_entity(store.pool(), USER, "TASK", "task-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(clock.get("client-a"), 2);
        assert_eq!(client, "client-a");

        assert!(store
            .latest_op_for_entity(store.pool(), USER, "TASK", "missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ops_after_respects_exclude_and_limit() {
        let store = SqliteStore::in_memory().await.unwrap();
        store_one(&store, &make_op("op-1", "client-a", "t1", 1)).await;
        store_one(&store, &make_op("op-2", "client-b", "t2", 1)).await;
        store_one(&store, &make_op("op-3", "client-a", "t3", 2)).await;

        let all = store
            .ops_after(store.pool(), USER, Seq::zero(), None, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let without_a = store
            .ops_after(store.pool(), USER, Seq::zero(), Some("client-a"), 10)
            .await
            .unwrap();
        assert_eq!(without_a.len(), 1);
        assert_eq!(without_a[0].id, "op-2");

        let limited = store
            .ops_after(store.pool(), USER, Seq::zero(), None, 2)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn min_seq_tracks_deletes() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.min_seq(store.pool(), USER).await.unwrap().is_none());

        store_one(&store, &make_op("op-1", "client-a", "t1", 1)).await;
        store_one(&store, &make_op("op-2", "client-a", "t2", 2)).await;
        store_one(&store, &make_op("op-3", "client-a", "t3", 3)).await;

        store.delete_ops_up_to(USER, Seq::new(2)).await.unwrap();
        assert_eq!(
            store.min_seq(store.pool(), USER).await.unwrap(),
            Some(Seq::new(3))
        );
    }

    #[tokio::test]
    async fn payload_bytes_sums_lengths() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.payload_bytes(USER).await.unwrap(), 0);

        store_one(&store, &make_op("op-1", "client-a", "t1", 1)).await;
        let bytes = store.payload_bytes(USER).await.unwrap();
        assert_eq!(bytes as usize, json!({"title": "op-1"}).to_string().len());
    }

    #[tokio::test]
    async fn device_upsert_and_ack() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = now_ms();
        store
            .upsert_device(store.pool(), USER, "client-a", now)
            .await
            .unwrap();
        store
            .upsert_device(store.pool(), USER, "client-a", now + 1)
            .await
            .unwrap();

        assert_eq!(
            store.online_device_count(USER, now - 1000).await.unwrap(),
            1
        );

        assert!(store
            .record_device_ack(USER, "client-a", Seq::new(5), now + 2)
            .await
            .unwrap());
        assert!(!store
            .record_device_ack(USER, "unknown", Seq::new(5), now + 2)
            .await
            .unwrap());
        assert_eq!(
            store.min_acked_seq(USER).await.unwrap(),
            Some(Seq::new(5))
        );
    }

    #[tokio::test]
    async fn stale_devices_are_deleted() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_device(store.pool(), USER, "old", 1_000)
            .await
            .unwrap();
        store
            .upsert_device(store.pool(), USER, "fresh", 5_000)
            .await
            .unwrap();

        let deleted = store.delete_stale_devices(2_000).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.online_device_count(USER, 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn snapshot_blob_roundtrip_and_clear() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.ensure_sync_state(store.pool(), USER).await.unwrap();

        assert!(store
            .load_snapshot_blob(store.pool(), USER)
            .await
            .unwrap()
            .is_none());

        store
            .store_snapshot_blob(store.pool(), USER, b"blob", Seq::new(4), 123)
            .await
            .unwrap();
        let blob = store
            .load_snapshot_blob(store.pool(), USER)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blob.data, b"blob");
        assert_eq!(blob.seq, Seq::new(4));
        assert_eq!(blob.generated_at, 123);

        store.clear_snapshot_blob(USER).await.unwrap();
        assert!(store
            .load_snapshot_blob(store.pool(), USER)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn full_state_queries() {
        let store = SqliteStore::in_memory().await.unwrap();
        store_one(&store, &make_op("op-1", "client-a", "t1", 1)).await;

        let mut import = make_op("op-2", "client-a", "t1", 2);
        import.op.op_kind = OpKind::SyncImport;
        import.op.entity_type = "ALL".to_string();
        import.op.entity_id = None;
        store_one(&store, &import).await;

        store_one(&store, &make_op("op-3", "client-a", "t1", 3)).await;

        assert_eq!(
            store
                .latest_full_state_seq(store.pool(), USER)
                .await
                .unwrap(),
            Some(Seq::new(2))
        );
        let points = store.full_state_ops(store.pool(), USER, 10).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].kind, OpKind::SyncImport);
        assert_eq!(
            store.full_state_seqs_asc(store.pool(), USER).await.unwrap(),
            vec![Seq::new(2)]
        );
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog.db");

        let store = SqliteStore::new(&path).await.unwrap();
        store_one(&store, &make_op("op-1", "client-a", "task-1", 1)).await;
        drop(store);

        let reopened = SqliteStore::new(&path).await.unwrap();
        assert!(reopened
            .op_exists(reopened.pool(), USER, "op-1")
            .await
            .unwrap());
        assert_eq!(
            reopened.last_seq(reopened.pool(), USER).await.unwrap(),
            Seq::new(1)
        );
    }

    #[tokio::test]
    async fn merged_clock_through_takes_pointwise_max() {
        let store = SqliteStore::in_memory().await.unwrap();
        store_one(&store, &make_op("op-1", "client-a", "t1", 1)).await;
        store_one(&store, &make_op("op-2", "client-b", "t2", 4)).await;
        store_one(&store, &make_op("op-3", "client-a", "t3", 3)).await;

        let merged = store
            .merged_clock_through(store.pool(), USER, Seq::new(2))
            .await
            .unwrap();
        assert_eq!(merged.get("client-a"), 1);
        assert_eq!(merged.get("client-b"), 4);
    }
}
