use std::path::Path;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::RunQueryDsl;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::envelope::Target;
use crate::error::{FleetwireError, Result};
use crate::outbox::schema::network_outbox;
use crate::outbox::store::{OutboxStore, StoredMessage};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

type SqliteAsyncConn = SyncConnectionWrapper<SqliteConnection>;
type SqlitePool = Pool<SqliteAsyncConn>;
type SqlitePooledConn<'a> = PooledConnection<'a, SqliteAsyncConn>;

#[derive(Queryable)]
struct OutboxRow {
    id: i64,
    owner_id: String,
    channel: String,
    data: String,
    target: String,
    target_server: Option<String>,
    created_at: i64,
    attempts: i32,
    last_attempt_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = network_outbox)]
struct NewOutboxMessage<'a> {
    owner_id: &'a str,
    channel: &'a str,
    data: &'a str,
    target: &'a str,
    target_server: Option<&'a str>,
    created_at: i64,
    attempts: i32,
    last_attempt_at: i64,
}

/// SQLite-backed [`OutboxStore`].
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub async fn new(sqlite_path: impl AsRef<str>) -> Result<Self> {
        let sqlite_path = sqlite_path.as_ref();
        ensure_parent_dir(sqlite_path)?;
        run_migrations(sqlite_path).await?;

        let manager = AsyncDieselConnectionManager::<SqliteAsyncConn>::new(sqlite_path);
        let pool: SqlitePool = Pool::builder()
            .build(manager)
            .await
            .map_err(|e| FleetwireError::Store(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<SqlitePooledConn<'_>> {
        self.pool
            .get()
            .await
            .map_err(|e| FleetwireError::Store(e.to_string()))
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn enqueue(
        &self,
        owner_id: &str,
        target: Target,
        target_server: Option<&str>,
        channel: &str,
        data: &str,
        created_at: i64,
    ) -> Result<i64> {
        let new = NewOutboxMessage {
            owner_id,
            channel,
            data,
            target: target.as_str(),
            target_server,
            created_at,
            attempts: 0,
            last_attempt_at: 0,
        };

        let mut conn = self.conn().await?;
        diesel::insert_into(network_outbox::table)
            .values(&new)
            .execute(&mut conn)
            .await
            .map_err(|e| FleetwireError::Store(e.to_string()))?;

        let row: OutboxRow = network_outbox::table
            .filter(network_outbox::owner_id.eq(owner_id))
            .order(network_outbox::id.desc())
            .first(&mut conn)
            .await
            .map_err(|e| FleetwireError::Store(e.to_string()))?;
        Ok(row.id)
    }

    async fn fetch_batch(&self, owner_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let rows: Vec<OutboxRow> = network_outbox::table
            .filter(network_outbox::owner_id.eq(owner_id))
            .order(network_outbox::id.asc())
            .limit(limit as i64)
            .load(&mut conn)
            .await
            .map_err(|e| FleetwireError::Store(e.to_string()))?;
        Ok(rows.into_iter().map(map_row).collect())
    }

    async fn delete_by_ids(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        diesel::delete(network_outbox::table.filter(network_outbox::id.eq_any(ids.to_vec())))
            .execute(&mut conn)
            .await
            .map_err(|e| FleetwireError::Store(e.to_string()))?;
        Ok(())
    }

    async fn record_attempt(&self, id: i64, now: i64) -> Result<()> {
        if id <= 0 {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        diesel::update(network_outbox::table.filter(network_outbox::id.eq(id)))
            .set((
                network_outbox::attempts.eq(network_outbox::attempts + 1),
                network_outbox::last_attempt_at.eq(now),
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| FleetwireError::Store(e.to_string()))?;
        Ok(())
    }
}

fn map_row(row: OutboxRow) -> StoredMessage {
    StoredMessage {
        id: row.id,
        owner_id: row.owner_id,
        channel: row.channel,
        data: row.data,
        target: row.target,
        target_server: row.target_server,
        created_at: row.created_at,
        attempts: row.attempts,
        last_attempt_at: row.last_attempt_at,
    }
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent).map_err(|e| FleetwireError::Store(e.to_string()))?;
    }
    Ok(())
}

async fn run_migrations(database_url: &str) -> Result<()> {
    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = SqliteConnection::establish(&database_url)
            .map_err(|e| FleetwireError::Store(e.to_string()))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| FleetwireError::Store(e.to_string()))?;
        Ok::<_, FleetwireError>(())
    })
    .await
    .map_err(|e| FleetwireError::Store(e.to_string()))??;
    Ok(())
}
