//! Request and result types shared by every bulk operation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::field::{FieldMapping, QualifiedName};
use crate::hash::KeyBuilder;
use crate::staging::StagingRelation;
use crate::value::Value;

// ── Operation kind ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Merge,
    Update,
    Delete,
    DeleteByKey,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Merge => "merge",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::DeleteByKey => "delete_by_key",
        }
    }

    /// Whether the operation matches staged rows against the destination.
    pub fn needs_qualifiers(&self) -> bool {
        !matches!(self, OperationKind::Insert)
    }

    /// Whether the operation can report identities.
    pub fn supports_identity(&self) -> bool {
        matches!(
            self,
            OperationKind::Insert | OperationKind::Merge | OperationKind::Update
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to the destination's identity column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityBehavior {
    /// Let the server generate identities and do not report them.
    #[default]
    Ignore,
    /// Write the caller's identity values.
    KeepIdentity,
    /// Let the server generate identities and correlate them to input rows.
    ReturnIdentity,
}

impl IdentityBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityBehavior::Ignore => "ignore",
            IdentityBehavior::KeepIdentity => "keep_identity",
            IdentityBehavior::ReturnIdentity => "return_identity",
        }
    }
}

/// How a merge applies staged rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// `INSERT ... ON CONFLICT (qualifiers) DO UPDATE`. Requires a unique
    /// constraint on the qualifier columns.
    #[default]
    ConflictClause,
    /// `UPDATE` matching rows, then `INSERT` the rest.
    InsertThenUpdate,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::ConflictClause => "conflict_clause",
            MergeStrategy::InsertThenUpdate => "insert_then_update",
        }
    }
}

// ── Cancellation ───────────────────────────────────────────────────────────

/// Cooperative cancellation flag, checked between rows.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ── Caller options ─────────────────────────────────────────────────────────

/// Per-call options. Everything is optional; unset values fall back to
/// the table schema and to [`BulkConfig`](crate::config::BulkConfig).
#[derive(Debug, Clone, Default)]
pub struct BulkOptions {
    /// Restrict the written fields. Defaults to every source field that
    /// matches a destination column.
    pub fields: Option<Vec<String>>,
    /// Match key for merge, update and delete. Defaults to the primary key.
    pub qualifiers: Option<Vec<String>>,
    pub identity_behavior: IdentityBehavior,
    pub merge_strategy: Option<MergeStrategy>,
    pub batch_size: Option<usize>,
    /// Stage into a regular table instead of a temporary one.
    pub use_physical_staging: bool,
    /// Timeout applied independently to staging, streaming and reconciliation.
    pub timeout: Option<Duration>,
    /// Table hints. Not supported by PostgreSQL; setting them is an error.
    pub hints: Option<String>,
    pub cancellation: Option<CancellationToken>,
}

impl BulkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.fields = Some(fields.iter().map(|f| f.as_ref().to_string()).collect());
        self
    }

    pub fn qualifiers<S: AsRef<str>>(mut self, qualifiers: &[S]) -> Self {
        self.qualifiers = Some(qualifiers.iter().map(|q| q.as_ref().to_string()).collect());
        self
    }

    pub fn identity(mut self, behavior: IdentityBehavior) -> Self {
        self.identity_behavior = behavior;
        self
    }

    pub fn return_identity(self) -> Self {
        self.identity(IdentityBehavior::ReturnIdentity)
    }

    pub fn merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = Some(strategy);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Stage into a regular table in the configured schema instead of a
    /// temporary one. The name carries the session's backend pid.
    pub fn physical_staging(mut self) -> Self {
        self.use_physical_staging = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn hints(mut self, hints: &str) -> Self {
        self.hints = Some(hints.to_string());
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

// ── Resolved request ───────────────────────────────────────────────────────

/// The destination's identity column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityColumn {
    pub name: String,
    pub generated_always: bool,
}

/// A fully resolved bulk call: what to stage, how to match and what to
/// report. Drives SQL generation and is the command cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRequest {
    pub kind: OperationKind,
    pub staging: StagingRelation,
    pub destination: QualifiedName,
    pub order_column: String,
    pub mappings: Vec<FieldMapping>,
    /// Destination column names used as the match key.
    pub qualifiers: Vec<String>,
    pub primary_keys: Vec<String>,
    pub identity: Option<IdentityColumn>,
    pub identity_behavior: IdentityBehavior,
    pub merge_strategy: MergeStrategy,
    pub hints: Option<String>,
}

impl BulkRequest {
    /// Structural hash of every SQL-relevant field.
    pub fn cache_key(&self) -> u64 {
        let mappings: Vec<String> = self
            .mappings
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}:{}",
                    m.column,
                    m.wire,
                    m.staged_type,
                    m.cast_to.as_deref().unwrap_or("")
                )
            })
            .collect();
        let identity = self
            .identity
            .as_ref()
            .map(|i| format!("{}:{}", i.name, i.generated_always));

        KeyBuilder::new()
            .part(self.kind.as_str())
            .part(&self.staging.name.quoted())
            .part(if self.staging.temporary { "temp" } else { "physical" })
            .part(if self.staging.unlogged { "unlogged" } else { "logged" })
            .part(&self.destination.quoted())
            .part(&self.order_column)
            .list(&mappings)
            .list(&self.qualifiers)
            .list(&self.primary_keys)
            .opt(identity.as_deref())
            .part(self.identity_behavior.as_str())
            .part(self.merge_strategy.as_str())
            .opt(self.hints.as_deref())
            .finish()
    }

    pub fn returns_identity(&self) -> bool {
        self.identity_behavior == IdentityBehavior::ReturnIdentity && self.kind.supports_identity()
    }

    /// Whether the identity column is written from staged values.
    pub fn writes_identity(&self) -> bool {
        self.identity_behavior == IdentityBehavior::KeepIdentity
    }

    /// Whether the match key contains an identity the server generates.
    ///
    /// Staged values of such a key are placeholders for new rows, so rows
    /// sharing one are distinct rows, not duplicates.
    pub fn keyed_on_generated_identity(&self) -> bool {
        !self.writes_identity() && self.qualifiers.iter().any(|q| self.is_identity(q))
    }

    pub fn mapping(&self, column: &str) -> Option<&FieldMapping> {
        self.mappings
            .iter()
            .find(|m| m.column.eq_ignore_ascii_case(column))
    }

    pub fn is_identity(&self, column: &str) -> bool {
        self.identity
            .as_ref()
            .is_some_and(|i| i.name.eq_ignore_ascii_case(column))
    }

    pub fn is_primary(&self, column: &str) -> bool {
        self.primary_keys
            .iter()
            .any(|p| p.eq_ignore_ascii_case(column))
    }

    pub fn is_qualifier(&self, column: &str) -> bool {
        self.qualifiers
            .iter()
            .any(|q| q.eq_ignore_ascii_case(column))
    }

    /// Columns written by an `INSERT` into the destination.
    pub fn insert_columns(&self) -> Vec<&FieldMapping> {
        self.mappings
            .iter()
            .filter(|m| self.writes_identity() || !self.is_identity(&m.column))
            .collect()
    }

    /// Columns assigned by an `UPDATE` of matched rows.
    pub fn update_columns(&self) -> Vec<&FieldMapping> {
        self.mappings
            .iter()
            .filter(|m| {
                !self.is_qualifier(&m.column)
                    && !self.is_primary(&m.column)
                    && !self.is_identity(&m.column)
            })
            .collect()
    }
}

// ── Results ────────────────────────────────────────────────────────────────

/// A server identity correlated to the input row at `index`.
///
/// `index` is the OrderToken of the originating row, or `-1` when the
/// identity could not be tied to a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityResult {
    pub index: i64,
    pub identity: Value,
}

impl IdentityResult {
    pub fn new(index: i64, identity: Value) -> Self {
        IdentityResult { index, identity }
    }

    pub fn uncorrelated(identity: Value) -> Self {
        IdentityResult {
            index: -1,
            identity,
        }
    }

    pub fn is_correlated(&self) -> bool {
        self.index >= 0
    }
}

/// What a successful bulk call reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkOutcome {
    /// Rows inserted, updated or deleted in the destination.
    pub affected: u64,
    /// Rows streamed into the staging relation.
    pub staged: u64,
    /// Correlated identities ordered by index. Empty unless identities
    /// were requested.
    pub identities: Vec<IdentityResult>,
}

impl BulkOutcome {
    pub fn identity_of(&self, index: i64) -> Option<&Value> {
        self.identities
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|pos| &self.identities[pos].identity)
    }
}
