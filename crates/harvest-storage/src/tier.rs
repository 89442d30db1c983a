use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::AccountRecord;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error on tier {tier}: {source}")]
    Database {
        tier: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("tier {tier} is append-only and cannot upsert")]
    UpsertUnsupported { tier: String },
    #[error("count {value} for {identity} does not fit a signed 64-bit column")]
    CountOverflow { identity: String, value: u64 },
    #[error("tier {tier} holds a negative count {value} for {identity}")]
    InvalidCount {
        tier: String,
        identity: String,
        value: i64,
    },
    #[error("unsupported database url {0:?}; expected sqlite: or postgres:")]
    UnsupportedUrl(String),
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
}

/// Physical layout of a tier's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierLayout {
    /// One row per identity; supports upsert.
    Keyed,
    /// Insert-only history; the same identity may appear many times.
    AppendOnly,
}

/// How a batch lands in its destination tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteSemantics {
    /// Insert, or update every non-key field when the identity already exists.
    Upsert,
    /// Plain insert.
    Append,
}

/// Rows read from a tier plus the highest row id seen.
#[derive(Debug, Clone, Default)]
pub struct TierBatch {
    pub records: Vec<AccountRecord>,
    pub high_water: Option<i64>,
}

impl TierBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One storage tier of account rows, ordered by insertion.
#[async_trait]
pub trait AccountTier: Send + Sync {
    fn name(&self) -> &str;
    fn layout(&self) -> TierLayout;

    /// Rows whose row id is at or below `high_water`, oldest first.
    async fn read_through(&self, high_water: i64) -> Result<TierBatch, StorageError>;

    async fn read_all(&self) -> Result<TierBatch, StorageError> {
        self.read_through(i64::MAX).await
    }

    /// Write all records in a single transaction. Returns rows affected.
    ///
    /// An upsert that hits an existing identity also moves that row to a
    /// fresh row id, above every row id already in the tier.
    async fn write_batch(
        &self,
        records: &[AccountRecord],
        semantics: WriteSemantics,
    ) -> Result<u64, StorageError>;

    /// Like [`AccountTier::write_batch`], but at most once per `batch_id`.
    /// The batch marker commits in the same transaction as the rows.
    /// Returns `None` when the batch was already applied.
    async fn apply_batch(
        &self,
        batch_id: &str,
        records: &[AccountRecord],
        semantics: WriteSemantics,
    ) -> Result<Option<u64>, StorageError>;

    /// Delete rows whose row id is at or below `high_water`.
    async fn clear_through(&self, high_water: i64) -> Result<u64, StorageError>;

    /// Reclaim space after a clear.
    async fn compact(&self) -> Result<(), StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;

    /// Latest row per requested identity; `None` when absent.
    async fn lookup(
        &self,
        identities: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Option<AccountRecord>>, StorageError>;
}

/// Open a tier from a `sqlite:` or `postgres:` URL, creating its table if needed.
pub async fn connect_tier(
    url: &str,
    table: &str,
    layout: TierLayout,
) -> Result<Arc<dyn AccountTier>, StorageError> {
    if url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteTier::connect(url, table, layout).await?))
    } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        Ok(Arc::new(PgTier::connect(url, table, layout).await?))
    } else {
        Err(StorageError::UnsupportedUrl(url.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Dialect {
    Sqlite,
    Postgres,
}

const COLUMNS: &str = "identity, post_count, follower_count, following_count, is_private, \
                       bio_has_contact_marker, has_external_link, is_verified";

#[derive(Debug, Clone)]
struct TierSql {
    create: Vec<String>,
    insert: String,
    upsert: Option<String>,
    mark_batch: String,
    select_through: String,
    select_identity: String,
    delete_through: String,
    count: String,
    vacuum: String,
}

impl TierSql {
    fn build(table: &str, layout: TierLayout, dialect: Dialect) -> Result<Self, StorageError> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StorageError::InvalidTable(table.to_string()));
        }

        let p = |n: usize| match dialect {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${n}"),
        };
        let (row_id, int, boolean) = match dialect {
            Dialect::Sqlite => ("row_id INTEGER PRIMARY KEY AUTOINCREMENT", "INTEGER", "BOOLEAN"),
            Dialect::Postgres => ("row_id BIGSERIAL PRIMARY KEY", "BIGINT", "BOOLEAN"),
        };
        let identity = match layout {
            TierLayout::Keyed => "identity TEXT NOT NULL UNIQUE",
            TierLayout::AppendOnly => "identity TEXT NOT NULL",
        };

        let mut create = vec![format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                {row_id},
                {identity},
                post_count {int} NOT NULL,
                follower_count {int} NOT NULL,
                following_count {int} NOT NULL,
                is_private {boolean} NOT NULL,
                bio_has_contact_marker {boolean} NOT NULL,
                has_external_link {boolean} NOT NULL,
                is_verified {boolean} NOT NULL
            )"
        )];
        if layout == TierLayout::AppendOnly {
            create.push(format!(
                "CREATE INDEX IF NOT EXISTS {table}_identity_idx ON {table} (identity)"
            ));
        }
        create.push(format!(
            "CREATE TABLE IF NOT EXISTS {table}_batches (batch_id TEXT PRIMARY KEY)"
        ));
        let next_row_id = match dialect {
            Dialect::Sqlite => format!(
                "(SELECT MAX(
                    COALESCE((SELECT seq FROM sqlite_sequence WHERE name = '{table}'), 0),
                    COALESCE((SELECT MAX(row_id) FROM {table}), 0)
                 ) + 1)"
            ),
            Dialect::Postgres => format!("nextval(pg_get_serial_sequence('{table}', 'row_id'))"),
        };

        let values = (1..=8).map(|n| p(n)).collect::<Vec<_>>().join(", ");
        let insert = format!("INSERT INTO {table} ({COLUMNS}) VALUES ({values})");
        let upsert = (layout == TierLayout::Keyed).then(|| {
            format!(
                "{insert}
                 ON CONFLICT (identity) DO UPDATE SET
                    row_id = {next_row_id},
                    post_count = excluded.post_count,
                    follower_count = excluded.follower_count,
                    following_count = excluded.following_count,
                    is_private = excluded.is_private,
                    bio_has_contact_marker = excluded.bio_has_contact_marker,
                    has_external_link = excluded.has_external_link,
                    is_verified = excluded.is_verified"
            )
        });

        Ok(Self {
            create,
            upsert,
            mark_batch: format!(
                "INSERT INTO {table}_batches (batch_id) VALUES ({}) ON CONFLICT (batch_id) DO NOTHING",
                p(1)
            ),
            select_through: format!(
                "SELECT row_id, {COLUMNS} FROM {table} WHERE row_id <= {} ORDER BY row_id",
                p(1)
            ),
            select_identity: format!(
                "SELECT row_id, {COLUMNS} FROM {table} WHERE identity = {} ORDER BY row_id DESC LIMIT 1",
                p(1)
            ),
            delete_through: format!("DELETE FROM {table} WHERE row_id <= {}", p(1)),
            count: format!("SELECT COUNT(*) AS n FROM {table}"),
            vacuum: match dialect {
                Dialect::Sqlite => "VACUUM".to_string(),
                Dialect::Postgres => format!("VACUUM {table}"),
            },
            insert,
        })
    }

    fn write_statement(
        &self,
        tier: &str,
        semantics: WriteSemantics,
    ) -> Result<&str, StorageError> {
        match semantics {
            WriteSemantics::Append => Ok(&self.insert),
            WriteSemantics::Upsert => {
                self.upsert
                    .as_deref()
                    .ok_or_else(|| StorageError::UpsertUnsupported {
                        tier: tier.to_string(),
                    })
            }
        }
    }
}

fn db_err(tier: &str) -> impl FnOnce(sqlx::Error) -> StorageError + '_ {
    move |source| StorageError::Database {
        tier: tier.to_string(),
        source,
    }
}

fn to_column(record: &AccountRecord, value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::CountOverflow {
        identity: record.identity.clone(),
        value,
    })
}

fn from_column(tier: &str, identity: &str, value: i64) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::InvalidCount {
        tier: tier.to_string(),
        identity: identity.to_string(),
        value,
    })
}

fn decode_row<R>(tier: &str, row: &R) -> Result<(i64, AccountRecord), StorageError>
where
    R: Row,
    for<'c> &'c str: sqlx::ColumnIndex<R>,
    for<'r> i64: sqlx::Decode<'r, R::Database>,
    i64: sqlx::Type<R::Database>,
    for<'r> bool: sqlx::Decode<'r, R::Database>,
    bool: sqlx::Type<R::Database>,
    for<'r> String: sqlx::Decode<'r, R::Database>,
    String: sqlx::Type<R::Database>,
{
    let get_i64 = |col: &str| row.try_get::<i64, _>(col).map_err(db_err(tier));
    let get_bool = |col: &str| row.try_get::<bool, _>(col).map_err(db_err(tier));

    let identity: String = row.try_get("identity").map_err(db_err(tier))?;
    let record = AccountRecord {
        post_count: from_column(tier, &identity, get_i64("post_count")?)?,
        follower_count: from_column(tier, &identity, get_i64("follower_count")?)?,
        following_count: from_column(tier, &identity, get_i64("following_count")?)?,
        is_private: get_bool("is_private")?,
        bio_has_contact_marker: get_bool("bio_has_contact_marker")?,
        has_external_link: get_bool("has_external_link")?,
        is_verified: get_bool("is_verified")?,
        identity,
    };
    Ok((get_i64("row_id")?, record))
}

fn collect_batch(rows: Vec<(i64, AccountRecord)>) -> TierBatch {
    let high_water = rows.iter().map(|(row_id, _)| *row_id).max();
    TierBatch {
        records: rows.into_iter().map(|(_, record)| record).collect(),
        high_water,
    }
}

/// SQLite-backed tier. Used for the local buffer; any tier may use it.
#[derive(Debug, Clone)]
pub struct SqliteTier {
    table: String,
    layout: TierLayout,
    sql: TierSql,
    pool: SqlitePool,
}

impl SqliteTier {
    pub async fn connect(url: &str, table: &str, layout: TierLayout) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_err(table))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err(table))?;
        Self::with_pool(pool, table, layout).await
    }

    /// Private in-memory database that lives as long as the returned tier.
    pub async fn in_memory(table: &str, layout: TierLayout) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err(table))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err(table))?;
        Self::with_pool(pool, table, layout).await
    }

    pub async fn with_pool(
        pool: SqlitePool,
        table: &str,
        layout: TierLayout,
    ) -> Result<Self, StorageError> {
        let sql = TierSql::build(table, layout, Dialect::Sqlite)?;
        for statement in &sql.create {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(db_err(table))?;
        }
        Ok(Self {
            table: table.to_string(),
            layout,
            sql,
            pool,
        })
    }
}

impl SqliteTier {
    /// One transaction: the optional batch marker, then every record.
    async fn write_in_tx(
        &self,
        batch_id: Option<&str>,
        records: &[AccountRecord],
        semantics: WriteSemantics,
    ) -> Result<Option<u64>, StorageError> {
        let statement = self.sql.write_statement(&self.table, semantics)?;
        let mut tx = self.pool.begin().await.map_err(db_err(&self.table))?;
        if let Some(batch_id) = batch_id {
            let marked = sqlx::query(&self.sql.mark_batch)
                .bind(batch_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err(&self.table))?;
            if marked.rows_affected() == 0 {
                tx.rollback().await.map_err(db_err(&self.table))?;
                return Ok(None);
            }
        }
        let mut affected = 0u64;
        for record in records {
            let result = sqlx::query(statement)
                .bind(record.identity.as_str())
                .bind(to_column(record, record.post_count)?)
                .bind(to_column(record, record.follower_count)?)
                .bind(to_column(record, record.following_count)?)
                .bind(record.is_private)
                .bind(record.bio_has_contact_marker)
                .bind(record.has_external_link)
                .bind(record.is_verified)
                .execute(&mut *tx)
                .await
                .map_err(db_err(&self.table))?;
            affected += result.rows_affected();
        }
        tx.commit().await.map_err(db_err(&self.table))?;
        Ok(Some(affected))
    }
}

#[async_trait]
impl AccountTier for SqliteTier {
    fn name(&self) -> &str {
        &self.table
    }

    fn layout(&self) -> TierLayout {
        self.layout
    }

    async fn read_through(&self, high_water: i64) -> Result<TierBatch, StorageError> {
        let rows = sqlx::query(&self.sql.select_through)
            .bind(high_water)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err(&self.table))?;
        let decoded = rows
            .iter()
            .map(|row| decode_row(&self.table, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(collect_batch(decoded))
    }

    async fn write_batch(
        &self,
        records: &[AccountRecord],
        semantics: WriteSemantics,
    ) -> Result<u64, StorageError> {
        Ok(self
            .write_in_tx(None, records, semantics)
            .await?
            .unwrap_or_default())
    }

    async fn apply_batch(
        &self,
        batch_id: &str,
        records: &[AccountRecord],
        semantics: WriteSemantics,
    ) -> Result<Option<u64>, StorageError> {
        self.write_in_tx(Some(batch_id), records, semantics).await
    }

    async fn clear_through(&self, high_water: i64) -> Result<u64, StorageError> {
        let result = sqlx::query(&self.sql.delete_through)
            .bind(high_water)
            .execute(&self.pool)
            .await
            .map_err(db_err(&self.table))?;
        Ok(result.rows_affected())
    }

    async fn compact(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(&self.sql.vacuum)
            .execute(&self.pool)
            .await
            .map_err(db_err(&self.table))?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query(&self.sql.count)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err(&self.table))?;
        let n: i64 = row.try_get("n").map_err(db_err(&self.table))?;
        from_column(&self.table, "*", n)
    }

    async fn lookup(
        &self,
        identities: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Option<AccountRecord>>, StorageError> {
        let mut out = BTreeMap::new();
        for identity in identities {
            let row = sqlx::query(&self.sql.select_identity)
                .bind(identity.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err(&self.table))?;
            let record = match row {
                Some(row) => Some(decode_row(&self.table, &row)?.1),
                None => None,
            };
            out.insert(identity.clone(), record);
        }
        Ok(out)
    }
}

/// Postgres-backed tier. The usual home of the primary store.
#[derive(Debug, Clone)]
pub struct PgTier {
    table: String,
    layout: TierLayout,
    sql: TierSql,
    pool: PgPool,
}

impl PgTier {
    pub async fn connect(url: &str, table: &str, layout: TierLayout) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(db_err(table))?;
        Self::with_pool(pool, table, layout).await
    }

    pub async fn with_pool(
        pool: PgPool,
        table: &str,
        layout: TierLayout,
    ) -> Result<Self, StorageError> {
        let sql = TierSql::build(table, layout, Dialect::Postgres)?;
        for statement in &sql.create {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(db_err(table))?;
        }
        Ok(Self {
            table: table.to_string(),
            layout,
            sql,
            pool,
        })
    }
}

impl PgTier {
    /// One transaction: the optional batch marker, then every record.
    async fn write_in_tx(
        &self,
        batch_id: Option<&str>,
        records: &[AccountRecord],
        semantics: WriteSemantics,
    ) -> Result<Option<u64>, StorageError> {
        let statement = self.sql.write_statement(&self.table, semantics)?;
        let mut tx = self.pool.begin().await.map_err(db_err(&self.table))?;
        if let Some(batch_id) = batch_id {
            let marked = sqlx::query(&self.sql.mark_batch)
                .bind(batch_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err(&self.table))?;
            if marked.rows_affected() == 0 {
                tx.rollback().await.map_err(db_err(&self.table))?;
                return Ok(None);
            }
        }
        let mut affected = 0u64;
        for record in records {
            let result = sqlx::query(statement)
                .bind(record.identity.as_str())
                .bind(to_column(record, record.post_count)?)
                .bind(to_column(record, record.follower_count)?)
                .bind(to_column(record, record.following_count)?)
                .bind(record.is_private)
                .bind(record.bio_has_contact_marker)
                .bind(record.has_external_link)
                .bind(record.is_verified)
                .execute(&mut *tx)
                .await
                .map_err(db_err(&self.table))?;
            affected += result.rows_affected();
        }
        tx.commit().await.map_err(db_err(&self.table))?;
        Ok(Some(affected))
    }
}

#[async_trait]
impl AccountTier for PgTier {
    fn name(&self) -> &str {
        &self.table
    }

    fn layout(&self) -> TierLayout {
        self.layout
    }

    async fn read_through(&self, high_water: i64) -> Result<TierBatch, StorageError> {
        let rows = sqlx::query(&self.sql.select_through)
            .bind(high_water)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err(&self.table))?;
        let decoded = rows
            .iter()
            .map(|row| decode_row(&self.table, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(collect_batch(decoded))
    }

    async fn write_batch(
        &self,
        records: &[AccountRecord],
        semantics: WriteSemantics,
    ) -> Result<u64, StorageError> {
        Ok(self
            .write_in_tx(None, records, semantics)
            .await?
            .unwrap_or_default())
    }

    async fn apply_batch(
        &self,
        batch_id: &str,
        records: &[AccountRecord],
        semantics: WriteSemantics,
    ) -> Result<Option<u64>, StorageError> {
        self.write_in_tx(Some(batch_id), records, semantics).await
    }

    async fn clear_through(&self, high_water: i64) -> Result<u64, StorageError> {
        let result = sqlx::query(&self.sql.delete_through)
            .bind(high_water)
            .execute(&self.pool)
            .await
            .map_err(db_err(&self.table))?;
        Ok(result.rows_affected())
    }

    async fn compact(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(&self.sql.vacuum)
            .execute(&self.pool)
            .await
            .map_err(db_err(&self.table))?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query(&self.sql.count)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err(&self.table))?;
        let n: i64 = row.try_get("n").map_err(db_err(&self.table))?;
        from_column(&self.table, "*", n)
    }

    async fn lookup(
        &self,
        identities: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Option<AccountRecord>>, StorageError> {
        let mut out = BTreeMap::new();
        for identity in identities {
            let row = sqlx::query(&self.sql.select_identity)
                .bind(identity.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err(&self.table))?;
            let record = match row {
                Some(row) => Some(decode_row(&self.table, &row)?.1),
                None => None,
            };
            out.insert(identity.clone(), record);
        }
        Ok(out)
    }
}
