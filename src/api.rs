//! User-facing bulk API.
//!
//! Every call stages the caller's rows with binary COPY, reconciles them
//! against the destination with set-based SQL and drops the staging
//! relation again, all inside one unit of work. Pass a
//! [`postgres::Client`] to let the call own its transaction, or an open
//! [`postgres::Transaction`] to make it part of yours.
//!
//! ```no_run
//! use pg_bulk::{BulkContext, BulkOptions, DataTable, Field, Value, bulk_insert};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = postgres::Client::connect("host=localhost user=postgres", postgres::NoTls)?;
//! let ctx = BulkContext::default();
//!
//! let mut rows = DataTable::new(Field::from_names(&["email", "name"]));
//! rows.push(vec![Value::from("ada@example.com"), Value::from("Ada")])?;
//!
//! let outcome = bulk_insert(
//!     &mut client,
//!     &ctx,
//!     "public.person",
//!     &mut rows.source(),
//!     &BulkOptions::new().return_identity(),
//! )?;
//! assert_eq!(outcome.affected, 1);
//! # Ok(())
//! # }
//! ```

use crate::error::BulkError;
use crate::executor::{self, BulkContext, BulkInput};
use crate::request::{BulkOptions, BulkOutcome, OperationKind};
use crate::session::BulkConnection;
use crate::source::{BulkEntity, EntitySource, RowSource, apply_identities};
use crate::value::Value;

/// Run one bulk operation, dispatching on `kind`.
///
/// # Arguments
/// - `table`: Schema-qualified (`'schema.table'`) or unqualified name.
/// - `input`: Rows, or key values for [`OperationKind::DeleteByKey`].
/// - `options`: Field selection, qualifiers, identity behavior, limits.
pub fn execute<C: BulkConnection>(
    conn: &mut C,
    ctx: &BulkContext,
    kind: OperationKind,
    table: &str,
    input: BulkInput<'_>,
    options: &BulkOptions,
) -> Result<BulkOutcome, BulkError> {
    executor::run(conn, ctx, kind, table, input, options)
}

/// Insert every row.
///
/// With `ReturnIdentity` the generated identities are reported per input
/// row index.
pub fn bulk_insert<C: BulkConnection>(
    conn: &mut C,
    ctx: &BulkContext,
    table: &str,
    rows: &mut dyn RowSource,
    options: &BulkOptions,
) -> Result<BulkOutcome, BulkError> {
    execute(conn, ctx, OperationKind::Insert, table, BulkInput::Rows(rows), options)
}

/// Update rows that match on the qualifiers and insert the rest.
///
/// When several input rows share a key, the last one wins.
pub fn bulk_merge<C: BulkConnection>(
    conn: &mut C,
    ctx: &BulkContext,
    table: &str,
    rows: &mut dyn RowSource,
    options: &BulkOptions,
) -> Result<BulkOutcome, BulkError> {
    execute(conn, ctx, OperationKind::Merge, table, BulkInput::Rows(rows), options)
}

/// Update rows that match on the qualifiers. Unmatched input rows are
/// ignored.
pub fn bulk_update<C: BulkConnection>(
    conn: &mut C,
    ctx: &BulkContext,
    table: &str,
    rows: &mut dyn RowSource,
    options: &BulkOptions,
) -> Result<BulkOutcome, BulkError> {
    execute(conn, ctx, OperationKind::Update, table, BulkInput::Rows(rows), options)
}

/// Delete rows that match on the qualifiers. Only the qualifier fields of
/// each row are staged.
pub fn bulk_delete<C: BulkConnection>(
    conn: &mut C,
    ctx: &BulkContext,
    table: &str,
    rows: &mut dyn RowSource,
    options: &BulkOptions,
) -> Result<BulkOutcome, BulkError> {
    execute(conn, ctx, OperationKind::Delete, table, BulkInput::Rows(rows), options)
}

/// Delete rows by a list of key values.
///
/// The key column is the single explicit qualifier, or the primary key when
/// it has exactly one column.
pub fn bulk_delete_by_key<C: BulkConnection>(
    conn: &mut C,
    ctx: &BulkContext,
    table: &str,
    keys: &[Value],
    options: &BulkOptions,
) -> Result<BulkOutcome, BulkError> {
    execute(
        conn,
        ctx,
        OperationKind::DeleteByKey,
        table,
        BulkInput::Keys(keys),
        options,
    )
}

/// Run `kind` over typed entities and write returned identities back into
/// them through [`BulkEntity::set_identity`].
pub fn execute_entities<C: BulkConnection, E: BulkEntity>(
    conn: &mut C,
    ctx: &BulkContext,
    kind: OperationKind,
    table: &str,
    entities: &mut [E],
    options: &BulkOptions,
) -> Result<BulkOutcome, BulkError> {
    let outcome = {
        let mut source = EntitySource::new(entities);
        execute(conn, ctx, kind, table, BulkInput::Rows(&mut source), options)?
    };
    let applied = apply_identities(entities, &outcome.identities);
    tracing::debug!(table, applied, "identities applied to entities");
    Ok(outcome)
}
