//! Error types for pg_bulk.
//!
//! All errors that can occur during a bulk operation are represented by
//! [`BulkError`]. Errors are propagated via `Result<T, BulkError>`
//! throughout the crate and returned unchanged to the caller.
//!
//! # Error Classification
//!
//! Errors are classified into five categories that tell the caller what
//! went wrong and when:
//! - **Configuration**: missing or inconsistent qualifiers, unsupported
//!   options. Detected before any row is streamed.
//! - **Schema**: the destination table or its columns do not fit the
//!   request. Detected before any row is streamed.
//! - **Protocol**: connection, staging, COPY or coercion failures,
//!   timeouts and cancellation. The call is aborted and cleaned up.
//! - **Reconciliation**: the set-based statement against the destination
//!   failed after the rows were staged. The unit of work is rolled back.
//! - **Internal**: bugs. Should not happen.

use std::fmt;

use postgres::error::SqlState;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    // ── Configuration errors: fail fast, nothing executed ───────────────
    /// No qualifier could be derived (no explicit list, no primary key).
    #[error("no qualifier fields could be resolved for table {table}")]
    MissingQualifier { table: String },

    /// A resolved qualifier is not part of the fields being written.
    #[error("qualifier fields not in the written field list for table {table}: {}", .missing.join(", "))]
    QualifierNotInFields { table: String, missing: Vec<String> },

    /// The compiler was asked to build a matching statement without qualifiers.
    #[error("no qualifiers defined for {operation} on table {table}")]
    NoQualifiers { operation: String, table: String },

    /// An update was requested but every written field is a key column.
    #[error("no updatable fields for table {table}")]
    NoUpdatableFields { table: String },

    /// The requested option is not supported by PostgreSQL.
    #[error("unsupported by the PostgreSQL dialect: {0}")]
    DialectUnsupported(String),

    /// An invalid argument was provided to an API function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Schema errors ────────────────────────────────────────────────────
    /// The destination table does not exist or is not visible.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// None of the source fields match a destination column.
    #[error("no fields found for table {table}")]
    NoFields { table: String },

    /// Explicitly requested fields are missing from the table or the source.
    #[error("fields not found for table {table}: {}", .columns.join(", "))]
    MissingColumns { table: String, columns: Vec<String> },

    /// `ReturnIdentity` was requested but the table has no identity column.
    #[error("identity column required but not found on table {table}")]
    IdentityRequired { table: String },

    // ── Protocol errors: call aborted, cleanup still runs ───────────────
    /// Connection or catalog access failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The staging relation could not be created.
    #[error("staging relation {relation} could not be created: {message}")]
    Staging { relation: String, message: String },

    /// The binary COPY stream failed.
    #[error("binary import into {relation} failed: {message}")]
    Protocol { relation: String, message: String },

    /// A value could not be coerced to the column's wire type.
    #[error("cannot write {from} value into column {column} ({to})")]
    Coercion {
        column: String,
        from: String,
        to: String,
    },

    /// A statement exceeded the configured timeout.
    #[error("timeout during {phase}")]
    Timeout { phase: Phase },

    /// The caller cancelled the operation.
    #[error("bulk operation cancelled after {rows_written} rows")]
    Cancelled { rows_written: u64 },

    // ── Reconciliation errors: rows staged, unit rolled back ────────────
    /// The reconciliation statement failed.
    #[error("reconciliation against {table} failed: {message}")]
    Reconciliation { table: String, message: String },

    // ── Internal errors: should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The phase of a bulk call in which a database error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Schema,
    Staging,
    Import,
    Reconcile,
    Cleanup,
    Transaction,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Schema => write!(f, "schema lookup"),
            Phase::Staging => write!(f, "staging"),
            Phase::Import => write!(f, "import"),
            Phase::Reconcile => write!(f, "reconciliation"),
            Phase::Cleanup => write!(f, "cleanup"),
            Phase::Transaction => write!(f, "transaction control"),
        }
    }
}

impl BulkError {
    /// Map a PostgreSQL error raised during `phase`.
    ///
    /// `relation` names the staging relation or the destination table,
    /// depending on the phase. A cancelled statement (SQLSTATE 57014) is
    /// reported as a timeout because the crate only cancels through
    /// `statement_timeout`.
    pub fn from_pg(phase: Phase, relation: &str, err: postgres::Error) -> Self {
        if err.code() == Some(&SqlState::QUERY_CANCELED) {
            return BulkError::Timeout { phase };
        }
        let message = match err.as_db_error() {
            Some(db) => db.message().to_string(),
            None => err.to_string(),
        };
        match phase {
            Phase::Schema | Phase::Cleanup | Phase::Transaction => {
                BulkError::Connection(format!("{phase} on {relation}: {message}"))
            }
            Phase::Staging => BulkError::Staging {
                relation: relation.to_string(),
                message,
            },
            Phase::Import => BulkError::Protocol {
                relation: relation.to_string(),
                message,
            },
            Phase::Reconcile => BulkError::Reconciliation {
                table: relation.to_string(),
                message,
            },
        }
    }

    /// Whether retrying the whole call may succeed.
    ///
    /// Only timeouts and connection failures are retryable. Everything
    /// else fails again with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BulkError::Timeout { .. } | BulkError::Connection(_))
    }

    /// Whether the error was raised before any row reached the server.
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self.kind(),
            BulkErrorKind::Configuration | BulkErrorKind::Schema
        )
    }
}

/// Classification of error kind for callers and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkErrorKind {
    Configuration,
    Schema,
    Protocol,
    Reconciliation,
    Internal,
}

impl fmt::Display for BulkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkErrorKind::Configuration => write!(f, "CONFIGURATION"),
            BulkErrorKind::Schema => write!(f, "SCHEMA"),
            BulkErrorKind::Protocol => write!(f, "PROTOCOL"),
            BulkErrorKind::Reconciliation => write!(f, "RECONCILIATION"),
            BulkErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl BulkError {
    /// Classify the error.
    pub fn kind(&self) -> BulkErrorKind {
        match self {
            BulkError::MissingQualifier { .. }
            | BulkError::QualifierNotInFields { .. }
            | BulkError::NoQualifiers { .. }
            | BulkError::NoUpdatableFields { .. }
            | BulkError::DialectUnsupported(_)
            | BulkError::InvalidArgument(_)
            | BulkError::InvalidConfig(_) => BulkErrorKind::Configuration,

            BulkError::TableNotFound(_)
            | BulkError::NoFields { .. }
            | BulkError::MissingColumns { .. }
            | BulkError::IdentityRequired { .. } => BulkErrorKind::Schema,

            BulkError::Connection(_)
            | BulkError::Staging { .. }
            | BulkError::Protocol { .. }
            | BulkError::Coercion { .. }
            | BulkError::Timeout { .. }
            | BulkError::Cancelled { .. } => BulkErrorKind::Protocol,

            BulkError::Reconciliation { .. } => BulkErrorKind::Reconciliation,

            BulkError::Internal(_) => BulkErrorKind::Internal,
        }
    }
}
