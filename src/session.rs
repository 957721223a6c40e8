//! Connection and session seams over the `postgres` client.
//!
//! A [`BulkConnection`] is what the caller hands in: a plain
//! [`postgres::Client`] (the call owns its transaction) or an open
//! [`postgres::Transaction`] (the call joins it through a savepoint). Either
//! way the call runs inside one [`BulkSession`], which is committed or
//! rolled back exactly once.

use std::time::Duration;

use postgres::binary_copy::BinaryCopyInWriter;
use postgres::types::{ToSql, Type};

use crate::catalog::{self, CatalogColumn};
use crate::error::{BulkError, Phase};
use crate::field::{QualifiedName, TableSchema, WireType};
use crate::request::IdentityResult;
use crate::value::Value;
use crate::writer::RowSink;

/// Savepoint used when joining a caller's transaction.
const SAVEPOINT: &str = "pg_bulk";

const CLEANUP_SAVEPOINT: &str = "pg_bulk_cleanup";

/// One unit of work against the server.
pub trait BulkSession {
    /// Read the destination's column snapshot; `None` if it does not exist.
    fn fetch_schema(&mut self, table: &QualifiedName) -> Result<Option<TableSchema>, BulkError>;

    /// Process id of the server backend running this session.
    fn backend_pid(&mut self) -> Result<i32, BulkError>;

    /// Bound every following statement of this unit of work.
    fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), BulkError>;

    /// Run one statement and return the affected row count.
    fn execute(&mut self, phase: Phase, relation: &str, sql: &str) -> Result<u64, BulkError>;

    /// Run a statement that returns `(__index, __identity)` rows.
    fn query_identities(
        &mut self,
        phase: Phase,
        relation: &str,
        sql: &str,
    ) -> Result<Vec<IdentityResult>, BulkError>;

    /// Open a binary COPY stream.
    fn copy_in(
        &mut self,
        relation: &str,
        sql: &str,
        types: &[WireType],
    ) -> Result<Box<dyn RowSink + '_>, BulkError>;

    fn commit(self) -> Result<(), BulkError>
    where
        Self: Sized;

    fn rollback(self) -> Result<(), BulkError>
    where
        Self: Sized;
}

/// Something a bulk call can open a session on.
pub trait BulkConnection {
    type Session<'s>: BulkSession
    where
        Self: 's;

    fn begin(&mut self) -> Result<Self::Session<'_>, BulkError>;

    /// Run `sql` outside any session, after the session has ended.
    fn cleanup(&mut self, sql: &str) -> Result<(), BulkError>;
}

// ── postgres backend ───────────────────────────────────────────────────────

/// A session over a `postgres` transaction or savepoint.
pub struct PgSession<'t> {
    tx: postgres::Transaction<'t>,
    /// The session is a savepoint inside a caller-owned transaction.
    nested: bool,
    /// `statement_timeout` to restore before releasing a savepoint, since
    /// `SET LOCAL` would otherwise outlive the call.
    previous_timeout: Option<String>,
}

impl<'t> PgSession<'t> {
    fn new(tx: postgres::Transaction<'t>, nested: bool) -> Self {
        PgSession {
            tx,
            nested,
            previous_timeout: None,
        }
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }
}

impl BulkSession for PgSession<'_> {
    fn fetch_schema(&mut self, table: &QualifiedName) -> Result<Option<TableSchema>, BulkError> {
        let quoted = table.quoted();
        let rows = self
            .tx
            .query(catalog::SCHEMA_QUERY, &[&quoted])
            .map_err(|e| BulkError::from_pg(Phase::Schema, &table.to_string(), e))?;
        let columns = rows
            .iter()
            .map(CatalogColumn::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        catalog::build_schema(table, columns)
    }

    fn backend_pid(&mut self) -> Result<i32, BulkError> {
        let map = |e| BulkError::from_pg(Phase::Staging, "pg_backend_pid", e);
        let row = self
            .tx
            .query_one("SELECT pg_backend_pid()", &[])
            .map_err(map)?;
        row.try_get(0).map_err(map)
    }

    fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), BulkError> {
        let map = |e| BulkError::from_pg(Phase::Transaction, "statement_timeout", e);
        if self.nested && self.previous_timeout.is_none() {
            let row = self
                .tx
                .query_one("SELECT current_setting('statement_timeout')", &[])
                .map_err(map)?;
            self.previous_timeout = Some(row.try_get(0).map_err(map)?);
        }
        let millis = timeout.as_millis().max(1).to_string();
        self.tx
            .execute(
                "SELECT set_config('statement_timeout', $1, true)",
                &[&millis],
            )
            .map_err(map)?;
        Ok(())
    }

    fn execute(&mut self, phase: Phase, relation: &str, sql: &str) -> Result<u64, BulkError> {
        tracing::trace!(%phase, sql, "execute");
        self.tx
            .execute(sql, &[])
            .map_err(|e| BulkError::from_pg(phase, relation, e))
    }

    fn query_identities(
        &mut self,
        phase: Phase,
        relation: &str,
        sql: &str,
    ) -> Result<Vec<IdentityResult>, BulkError> {
        tracing::trace!(%phase, sql, "query identities");
        let rows = self
            .tx
            .query(sql, &[])
            .map_err(|e| BulkError::from_pg(phase, relation, e))?;
        rows.iter()
            .map(|row| {
                let index: i64 = row
                    .try_get(0)
                    .map_err(|e| BulkError::from_pg(phase, relation, e))?;
                Ok(IdentityResult::new(index, Value::from_row(row, 1)?))
            })
            .collect()
    }

    fn copy_in(
        &mut self,
        relation: &str,
        sql: &str,
        types: &[WireType],
    ) -> Result<Box<dyn RowSink + '_>, BulkError> {
        let pg_types: Vec<Type> = types.iter().map(WireType::pg_type).collect();
        let copy = self
            .tx
            .copy_in(sql)
            .map_err(|e| BulkError::from_pg(Phase::Import, relation, e))?;
        Ok(Box::new(PgRowSink {
            writer: BinaryCopyInWriter::new(copy, &pg_types),
            relation: relation.to_string(),
            row: Vec::with_capacity(types.len()),
            pending: false,
        }))
    }

    fn commit(mut self) -> Result<(), BulkError> {
        if let Some(previous) = self.previous_timeout.take() {
            self.tx
                .execute(
                    "SELECT set_config('statement_timeout', $1, true)",
                    &[&previous],
                )
                .map_err(|e| BulkError::from_pg(Phase::Transaction, "statement_timeout", e))?;
        }
        let what = if self.nested { SAVEPOINT } else { "transaction" };
        self.tx
            .commit()
            .map_err(|e| BulkError::from_pg(Phase::Transaction, what, e))
    }

    fn rollback(self) -> Result<(), BulkError> {
        let what = if self.nested { SAVEPOINT } else { "transaction" };
        self.tx
            .rollback()
            .map_err(|e| BulkError::from_pg(Phase::Transaction, what, e))
    }
}

impl BulkConnection for postgres::Client {
    type Session<'s>
        = PgSession<'s>
    where
        Self: 's;

    fn begin(&mut self) -> Result<PgSession<'_>, BulkError> {
        let tx = self
            .transaction()
            .map_err(|e| BulkError::from_pg(Phase::Transaction, "transaction", e))?;
        Ok(PgSession::new(tx, false))
    }

    fn cleanup(&mut self, sql: &str) -> Result<(), BulkError> {
        self.batch_execute(sql)
            .map_err(|e| BulkError::from_pg(Phase::Cleanup, sql, e))
    }
}

impl<'c> BulkConnection for postgres::Transaction<'c> {
    type Session<'s>
        = PgSession<'s>
    where
        Self: 's;

    fn begin(&mut self) -> Result<PgSession<'_>, BulkError> {
        let tx = self
            .savepoint(SAVEPOINT)
            .map_err(|e| BulkError::from_pg(Phase::Transaction, SAVEPOINT, e))?;
        Ok(PgSession::new(tx, true))
    }

    /// Runs under a savepoint so a failure leaves the caller's transaction
    /// usable.
    fn cleanup(&mut self, sql: &str) -> Result<(), BulkError> {
        let map = |e| BulkError::from_pg(Phase::Cleanup, sql, e);
        let mut sp = self.savepoint(CLEANUP_SAVEPOINT).map_err(map)?;
        sp.batch_execute(sql).map_err(map)?;
        sp.commit().map_err(map)
    }
}

/// Binary COPY sink. Fields of the current row are buffered and written
/// when the next row starts or the stream completes.
struct PgRowSink<'a> {
    writer: BinaryCopyInWriter<'a>,
    relation: String,
    row: Vec<Box<dyn ToSql + Sync>>,
    pending: bool,
}

impl PgRowSink<'_> {
    fn flush_row(&mut self) -> Result<(), BulkError> {
        if !self.pending {
            return Ok(());
        }
        let params: Vec<&(dyn ToSql + Sync)> = self.row.iter().map(|p| p.as_ref()).collect();
        self.writer
            .write(&params)
            .map_err(|e| BulkError::from_pg(Phase::Import, &self.relation, e))?;
        self.row.clear();
        self.pending = false;
        Ok(())
    }
}

impl RowSink for PgRowSink<'_> {
    fn start_row(&mut self) -> Result<(), BulkError> {
        self.flush_row()?;
        self.pending = true;
        Ok(())
    }

    fn write_field(&mut self, value: Value, wire: WireType) -> Result<(), BulkError> {
        self.row.push(value.to_param(wire)?);
        Ok(())
    }

    fn write_null(&mut self, wire: WireType) -> Result<(), BulkError> {
        self.row.push(Value::Null.to_param(wire)?);
        Ok(())
    }

    fn complete(mut self: Box<Self>) -> Result<u64, BulkError> {
        self.flush_row()?;
        let PgRowSink {
            writer, relation, ..
        } = *self;
        writer
            .finish()
            .map_err(|e| BulkError::from_pg(Phase::Import, &relation, e))
    }
}
