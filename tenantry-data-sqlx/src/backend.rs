use std::any::Any;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tenantry_data::backend::{Backend, BackendRepository, Connection, RawQueryCapable};
use tenantry_data::lifecycle::{apply_update, deactivate, prepare_insert};
use tenantry_data::tx::TransactionSession;
use tenantry_data::{
    Context, DataError, ListParams, QueryBuilder, Record, RegistryBuilder, TransactionManager,
    Value,
};
use uuid::Uuid;

use crate::error::SqlxErrorExt;
use crate::row::{dynamic_record, EntityRow};
use crate::sql::{self, Bind, Filter};
use crate::tx::{SqliteTransactions, Tx};

pub const BACKEND_NAME: &str = "sqlite";

/// SQLite storage for every entity, one table per physical entity name.
///
/// Tables are created on first use. Operations join the transaction carried
/// by the context; without one, each operation runs in its own short
/// transaction so multi-statement work (update, list) stays consistent.
pub struct SqlxBackend {
    id: Uuid,
    pool: SqlitePool,
    /// The pool has exactly one connection (in-memory databases).
    pinned: bool,
    transactions: Arc<SqliteTransactions>,
    ready_tables: DashSet<String>,
}

impl SqlxBackend {
    pub fn new(pool: SqlitePool) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            transactions: Arc::new(SqliteTransactions::new(pool.clone(), id)),
            pinned: pool.options().get_max_connections() == 1,
            pool,
            ready_tables: DashSet::new(),
        }
    }

    /// Open a pool for `url` (`sqlite://path/to.db`, `sqlite::memory:`).
    ///
    /// In-memory databases are private to one connection, so the pool is
    /// pinned to a single long-lived connection for them.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DataError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(SqlxErrorExt::into_data_error)?
            .create_if_missing(true);
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(SqlxErrorExt::into_data_error)?;
        tracing::info!(url, in_memory, "Connected to SQLite");
        Ok(Self::new(pool))
    }

    /// Get the underlying pool reference.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Pooled connection for work outside any transaction.
    ///
    /// On a single-connection pool, a task that still holds the connection
    /// through its own open transaction would wait forever; it fails instead.
    async fn acquire(&self) -> Result<PoolConnection<Sqlite>, DataError> {
        if self.pinned && self.transactions.held_by_current() {
            return self.pool.try_acquire().ok_or_else(|| {
                DataError::Other(
                    "the only connection is held by this task's open transaction; \
                     pass the transaction's context"
                        .into(),
                )
            });
        }
        self.pool.acquire().await.map_err(SqlxErrorExt::into_data_error)
    }

    async fn session<'c>(&self, ctx: &'c Context, write: bool) -> Result<Session<'c>, DataError> {
        match ctx.transaction() {
            Some(tx) => {
                if tx.connection_id() != self.id {
                    return Err(DataError::ConnectionMismatch {
                        expected: self.id.to_string(),
                        actual: tx.connection_id().to_string(),
                    });
                }
                if write && tx.is_read_only() {
                    return Err(DataError::Write("transaction is read-only".into()));
                }
                Ok(Session::Joined(tx.session().await?))
            }
            None => Ok(Session::Scoped(
                sqlx::Transaction::begin(self.acquire().await?, None)
                    .await
                    .map_err(SqlxErrorExt::into_data_error)?,
            )),
        }
    }

    /// Begin a session and make sure `table` exists in it.
    async fn open<'c>(
        &self,
        ctx: &'c Context,
        table: &str,
        write: bool,
    ) -> Result<Session<'c>, DataError> {
        let quoted = sql::table_ident(table)?;
        let mut session = self.session(ctx, write).await?;
        if !self.ready_tables.contains(table) {
            let conn = session.conn()?;
            execute(conn, &sql::create_table(table), &[]).await?;
            execute(conn, &sql::create_index(table), &[]).await?;
            tracing::debug!(table = %quoted, "Ensured entity table");
        }
        Ok(session)
    }

    /// Commit an operation-scoped session. Joined sessions are left to
    /// their owner.
    async fn close(&self, session: Session<'_>, table: &str) -> Result<(), DataError> {
        let scoped = matches!(session, Session::Scoped(_));
        session.finish().await?;
        // DDL run inside a caller's transaction can still be rolled back.
        if scoped {
            self.ready_tables.insert(table.to_string());
        }
        Ok(())
    }

    async fn fetch_visible(
        conn: &mut SqliteConnection,
        ctx: &Context,
        table: &str,
        id: &str,
    ) -> Result<Record, DataError> {
        let filter = Filter::visible(ctx.tenant(), false).id(id);
        let statement = format!(
            "SELECT {} FROM {}{}",
            sql::COLUMNS,
            sql::table_ident(table)?,
            filter.to_sql()
        );
        let row = sql::bind_all(sqlx::query(&statement), &filter.binds)
            .fetch_optional(&mut *conn)
            .await
            .map_err(SqlxErrorExt::into_data_error)?
            .ok_or_else(|| DataError::not_found(table, id))?;
        EntityRow::decode(&row)?.into_record()
    }

    async fn write_row(
        conn: &mut SqliteConnection,
        table: &str,
        record: &Record,
    ) -> Result<(), DataError> {
        let row = EntityRow::from_record(record)?;
        let statement = format!(
            "UPDATE {} SET active = ?, date_modified = ?, data = ? WHERE id = ?",
            sql::table_ident(table)?
        );
        sqlx::query(&statement)
            .bind(row.active)
            .bind(row.date_modified)
            .bind(row.data)
            .bind(row.id)
            .execute(&mut *conn)
            .await
            .map_err(SqlxErrorExt::into_data_error)?;
        Ok(())
    }
}

/// Register a SQLite-backed repository constructor for `entity`.
pub fn register(
    builder: &mut RegistryBuilder,
    entity: &str,
    search_fields: &[&str],
) -> Result<(), DataError> {
    builder.register(
        BACKEND_NAME,
        entity,
        BackendRepository::<SqlxBackend>::constructor(entity, search_fields),
    )?;
    Ok(())
}

enum Session<'c> {
    /// Owned by a single operation.
    Scoped(sqlx::Transaction<'static, Sqlite>),
    /// Borrowed from the transaction carried by the context.
    Joined(TransactionSession<'c>),
}

impl Session<'_> {
    fn conn(&mut self) -> Result<&mut SqliteConnection, DataError> {
        match self {
            Session::Scoped(tx) => Ok(&mut **tx),
            Session::Joined(session) => session.driver_mut::<Tx>()?.as_mut(),
        }
    }

    async fn finish(self) -> Result<(), DataError> {
        match self {
            Session::Scoped(tx) => tx.commit().await.map_err(SqlxErrorExt::into_data_error),
            Session::Joined(_) => Ok(()),
        }
    }
}

async fn execute(conn: &mut SqliteConnection, statement: &str, binds: &[Bind]) -> Result<u64, DataError> {
    let result = sql::bind_all(sqlx::query(statement), binds)
        .execute(&mut *conn)
        .await
        .map_err(SqlxErrorExt::into_data_error)?;
    Ok(result.rows_affected())
}

async fn fetch_records(
    conn: &mut SqliteConnection,
    statement: &str,
    binds: &[Bind],
) -> Result<Vec<Record>, DataError> {
    sql::bind_all(sqlx::query(statement), binds)
        .fetch_all(&mut *conn)
        .await
        .map_err(SqlxErrorExt::into_data_error)?
        .iter()
        .map(|row| EntityRow::decode(row)?.into_record())
        .collect()
}

impl Connection for SqlxBackend {
    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[async_trait]
impl Backend for SqlxBackend {
    async fn create(&self, ctx: &Context, entity: &str, record: Record) -> Result<Record, DataError> {
        ctx.run(async {
            let record = prepare_insert(ctx, record);
            let row = EntityRow::from_record(&record)?;
            let mut session = self.open(ctx, entity, true).await?;
            let statement = format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?)",
                sql::table_ident(entity)?,
                sql::COLUMNS
            );
            sqlx::query(&statement)
                .bind(&row.id)
                .bind(&row.tenant_id)
                .bind(row.active)
                .bind(row.date_created)
                .bind(row.date_modified)
                .bind(&row.data)
                .execute(&mut *session.conn()?)
                .await
                .map_err(SqlxErrorExt::into_data_error)?;
            self.close(session, entity).await?;
            tracing::trace!(entity, id = %row.id, "Created record");
            Ok(record)
        })
        .await
    }

    async fn read(&self, ctx: &Context, entity: &str, id: &str) -> Result<Record, DataError> {
        ctx.run(async {
            let mut session = self.open(ctx, entity, false).await?;
            let record = Self::fetch_visible(session.conn()?, ctx, entity, id).await?;
            self.close(session, entity).await?;
            Ok(record)
        })
        .await
    }

    async fn update(
        &self,
        ctx: &Context,
        entity: &str,
        id: &str,
        record: Record,
    ) -> Result<Record, DataError> {
        ctx.run(async {
            let mut session = self.open(ctx, entity, true).await?;
            let conn = session.conn()?;
            let mut stored = Self::fetch_visible(conn, ctx, entity, id).await?;
            apply_update(&mut stored, record);
            Self::write_row(conn, entity, &stored).await?;
            self.close(session, entity).await?;
            Ok(stored)
        })
        .await
    }

    async fn delete(&self, ctx: &Context, entity: &str, id: &str) -> Result<(), DataError> {
        ctx.run(async {
            let mut session = self.open(ctx, entity, true).await?;
            let conn = session.conn()?;
            let mut stored = Self::fetch_visible(conn, ctx, entity, id).await?;
            deactivate(&mut stored);
            Self::write_row(conn, entity, &stored).await?;
            self.close(session, entity).await?;
            tracing::trace!(entity, id, "Soft-deleted record");
            Ok(())
        })
        .await
    }

    async fn list(
        &self,
        ctx: &Context,
        entity: &str,
        params: &ListParams,
    ) -> Result<(Vec<Record>, u64), DataError> {
        ctx.run(async {
            let table = sql::table_ident(entity)?;
            let mut filter = Filter::visible(ctx.tenant(), params.include_inactive);
            filter.conditions(&params.filters)?;
            if let Some(term) = params.search.as_deref() {
                filter.search(term, &params.search_fields)?;
            }
            let sort = params.sort.clone().unwrap_or_default();
            let count_sql = format!("SELECT COUNT(*) FROM {table}{}", filter.to_sql());
            let page_sql = format!(
                "SELECT {} FROM {table}{}{}{}",
                sql::COLUMNS,
                filter.to_sql(),
                sql::order_by(&[(sort.field.clone(), sort.is_ascending())])?,
                sql::limit_offset(Some(params.limit()), Some(params.offset())),
            );

            // Both statements run in one transaction and see one snapshot.
            let mut session = self.open(ctx, entity, false).await?;
            let conn = session.conn()?;
            let total: i64 = sql::bind_all(sqlx::query(&count_sql), &filter.binds)
                .fetch_one(&mut *conn)
                .await
                .and_then(|row| sqlx::Row::try_get(&row, 0))
                .map_err(SqlxErrorExt::into_data_error)?;
            let items = fetch_records(conn, &page_sql, &filter.binds).await?;
            self.close(session, entity).await?;
            Ok((items, total.max(0) as u64))
        })
        .await
    }

    async fn query(
        &self,
        ctx: &Context,
        entity: &str,
        query: &QueryBuilder,
    ) -> Result<Vec<Record>, DataError> {
        query.validate()?;
        ctx.run(async {
            let mut filter = Filter::visible(ctx.tenant(), query.includes_inactive());
            filter.conditions(query.conditions())?;
            let statement = format!(
                "SELECT {} FROM {}{}{}{}",
                sql::COLUMNS,
                sql::table_ident(entity)?,
                filter.to_sql(),
                sql::order_by(query.order())?,
                sql::limit_offset(query.limit_value(), query.offset_value()),
            );
            let mut session = self.open(ctx, entity, false).await?;
            let records = fetch_records(session.conn()?, &statement, &filter.binds).await?;
            self.close(session, entity).await?;
            Ok(records)
        })
        .await
    }

    async fn ping(&self, ctx: &Context) -> Result<(), DataError> {
        ctx.run(async {
            // The context's transaction may hold the only pooled connection.
            match ctx.transaction() {
                Some(tx) if tx.connection_id() == self.id => {
                    let mut session = self.session(ctx, false).await?;
                    execute(session.conn()?, "SELECT 1", &[]).await?;
                }
                _ => {
                    execute(&mut *self.acquire().await?, "SELECT 1", &[]).await?;
                }
            }
            Ok(())
        })
        .await
    }

    fn transactions(&self) -> Arc<dyn TransactionManager> {
        self.transactions.clone()
    }

    fn raw_query_capable(&self) -> Option<&dyn RawQueryCapable> {
        Some(self)
    }
}

#[async_trait]
impl RawQueryCapable for SqlxBackend {
    /// Run native SQL with positional `?` binds. Rows are decoded column by
    /// column; the statement joins the context's transaction if there is one.
    async fn raw_query(
        &self,
        ctx: &Context,
        statement: &str,
        binds: &[Value],
    ) -> Result<Vec<Record>, DataError> {
        ctx.run(async {
            let binds: Vec<Bind> = binds.iter().map(raw_bind).collect();
            let read_only = statement
                .trim_start()
                .get(..6)
                .is_some_and(|head| head.eq_ignore_ascii_case("select"));
            let mut session = self.session(ctx, !read_only).await?;
            let conn = session.conn()?;
            // A SELECT head does not stop later statements in the same text.
            let guarded = ctx.transaction().is_some_and(|tx| tx.is_read_only());
            if guarded {
                execute(conn, "PRAGMA query_only = ON", &[]).await?;
            }
            let fetched = sql::bind_all(sqlx::query(statement), &binds)
                .fetch_all(&mut *conn)
                .await
                .map_err(SqlxErrorExt::into_data_error);
            if guarded {
                execute(conn, "PRAGMA query_only = OFF", &[]).await?;
            }
            let rows = fetched?;
            let records = rows.iter().map(dynamic_record).collect::<Result<Vec<_>, _>>()?;
            session.finish().await?;
            tracing::debug!(rows = records.len(), "Raw query executed");
            Ok(records)
        })
        .await
    }
}

fn raw_bind(value: &Value) -> Bind {
    match value {
        Value::Null => Bind::Null,
        Value::Bool(b) => Bind::Int(i64::from(*b)),
        Value::Int(i) => Bind::Int(*i),
        Value::Float(f) => Bind::Float(*f),
        Value::String(s) => Bind::Text(s.clone()),
        other => Bind::Text(other.to_json().to_string()),
    }
}
