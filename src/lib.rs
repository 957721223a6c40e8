//! pg_bulk: bulk insert, merge, update and delete for PostgreSQL.
//!
//! Rows are streamed with binary `COPY` into a per-call staging relation
//! and applied to the destination with one set-based statement per
//! operation. Each staged row carries an OrderToken (its zero-based input
//! position), so server-generated identities can be reported back per
//! input row.
//!
//! # Layers
//!
//! - [`qualifier`] and [`executor::resolve_request`] turn caller options and
//!   the destination's catalog snapshot into a [`BulkRequest`].
//! - [`compiler`] renders every statement of a call; [`cache`] keeps the
//!   text and the snapshots across calls.
//! - [`staging`] and [`writer`] create the staging relation and stream rows
//!   into it.
//! - [`correlation`] runs reconciliation and ties identities to rows.
//! - [`executor`] sequences all of it as one unit of work; [`api`] is the
//!   public surface.
//!
//! The crate logs through `tracing` and installs no subscriber.

pub mod api;
pub mod cache;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod correlation;
pub mod error;
pub mod executor;
pub mod field;
mod hash;
pub mod qualifier;
pub mod request;
pub mod session;
pub mod source;
pub mod staging;
pub mod value;
pub mod writer;

#[cfg(test)]
mod test_helpers;

pub use api::{
    bulk_delete, bulk_delete_by_key, bulk_insert, bulk_merge, bulk_update, execute,
    execute_entities,
};
pub use cache::{CommandCache, SchemaCache};
pub use config::BulkConfig;
pub use correlation::IdentityAccumulator;
pub use error::{BulkError, BulkErrorKind, Phase};
pub use executor::{BulkContext, BulkInput};
pub use field::{Field, QualifiedName, WireType};
pub use request::{
    BulkOptions, BulkOutcome, BulkRequest, CancellationToken, IdentityBehavior, IdentityResult,
    MergeStrategy, OperationKind,
};
pub use session::{BulkConnection, BulkSession, PgSession};
pub use source::{
    BulkEntity, CursorSource, DataTable, EntitySource, FieldMapSource, KeySource, RowSource,
    apply_identities, pg_rows_source,
};
pub use value::{Value, row_values};
