//! Transactional orchestrator.
//!
//! Runs one bulk call as a single unit of work:
//!
//! ```text
//! Opened → Staged → Imported → Reconciled → CleanedUp → Closed
//! ```
//!
//! Any state may jump to `CleanedUp` on error. Configuration problems are
//! detected before a session is opened; schema problems before the staging
//! relation is created. The unit of work is either a transaction owned by
//! the call or a savepoint inside the caller's transaction (see
//! [`BulkConnection`]).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{CommandCache, SchemaCache};
use crate::compiler::{self, CommandSet};
use crate::config::BulkConfig;
use crate::correlation::{self, Reconciled};
use crate::error::BulkError;
use crate::field::{Field, FieldMapping, QualifiedName, TableSchema};
use crate::qualifier;
use crate::request::{
    BulkOptions, BulkOutcome, BulkRequest, IdentityBehavior, IdentityColumn, MergeStrategy,
    OperationKind,
};
use crate::session::{BulkConnection, BulkSession};
use crate::source::{KeySource, RowSource};
use crate::staging::{self, StagingRelation};
use crate::value::Value;
use crate::writer::{self, StreamSettings};

// ── Context ────────────────────────────────────────────────────────────────

/// Configuration and caches shared by bulk calls. Clones share the caches.
#[derive(Debug, Clone, Default)]
pub struct BulkContext {
    config: Arc<BulkConfig>,
    commands: CommandCache,
    schemas: SchemaCache,
}

impl BulkContext {
    pub fn new(config: BulkConfig) -> Result<Self, BulkError> {
        config.validate()?;
        Ok(BulkContext {
            config: Arc::new(config),
            commands: CommandCache::new(),
            schemas: SchemaCache::new(),
        })
    }

    /// Context configured from `PG_BULK_CONFIG`, or the defaults.
    pub fn from_env() -> Result<Self, BulkError> {
        Self::new(BulkConfig::load()?)
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    pub fn commands(&self) -> &CommandCache {
        &self.commands
    }

    pub fn schemas(&self) -> &SchemaCache {
        &self.schemas
    }

    /// Forget everything cached about `table`, e.g. after `ALTER TABLE`.
    pub fn invalidate(&self, table: &str) -> Result<(), BulkError> {
        let name = QualifiedName::parse(table)?;
        let schema = self.schemas.invalidate(&name);
        let commands = self.commands.invalidate(&name);
        tracing::debug!(table = %name, schema, commands, "cache invalidated");
        Ok(())
    }

    /// Flush both caches.
    pub fn clear(&self) {
        self.schemas.clear();
        self.commands.clear();
    }
}

// ── Input ──────────────────────────────────────────────────────────────────

/// The rows of one call.
pub enum BulkInput<'a> {
    /// Full rows; fields are matched to destination columns by name.
    Rows(&'a mut dyn RowSource),
    /// Key values for [`OperationKind::DeleteByKey`].
    Keys(&'a [Value]),
}

// ── Call state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    Opened,
    Staged,
    Imported,
    Reconciled,
    CleanedUp,
    Closed,
}

/// Where a call is, and whether its staging relation still needs a drop.
#[derive(Debug)]
struct Progress {
    state: CallState,
    /// Teardown DDL of a staging relation that was created and not yet
    /// dropped.
    pending_teardown: Option<String>,
}

impl Progress {
    fn new() -> Self {
        Progress {
            state: CallState::Opened,
            pending_teardown: None,
        }
    }

    fn advance(&mut self, next: CallState) {
        tracing::trace!(from = ?self.state, to = ?next, "call state");
        self.state = next;
    }

    fn staged(&mut self, teardown: &str) {
        self.pending_teardown = Some(teardown.to_string());
        self.advance(CallState::Staged);
    }

    fn dropped(&mut self) {
        self.pending_teardown = None;
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

/// Run one bulk operation against `table`.
///
/// The outcome is all-or-nothing: on error the unit of work is rolled back
/// and no partial count is reported.
pub fn run<C: BulkConnection>(
    conn: &mut C,
    ctx: &BulkContext,
    kind: OperationKind,
    table: &str,
    input: BulkInput<'_>,
    options: &BulkOptions,
) -> Result<BulkOutcome, BulkError> {
    let destination = preflight(kind, table, &input, options)?;

    let span = tracing::info_span!("bulk", table = %destination, operation = %kind);
    let _enter = span.enter();
    let started = Instant::now();

    let mut progress = Progress::new();
    let mut session = conn.begin()?;
    let result = run_in_session(
        &mut session,
        ctx,
        kind,
        &destination,
        input,
        options,
        &mut progress,
    );

    let result = match result {
        Ok(outcome) => session.commit().map(|()| outcome),
        Err(e) => {
            if let Err(rollback) = session.rollback() {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    };

    if let Some(sql) = progress.pending_teardown.take() {
        if let Err(e) = conn.cleanup(&sql) {
            tracing::warn!(error = %e, "staging cleanup failed");
        }
    }
    if progress.state < CallState::CleanedUp {
        progress.advance(CallState::CleanedUp);
    }
    progress.advance(CallState::Closed);

    match &result {
        Ok(outcome) => tracing::info!(
            rows = outcome.staged,
            affected = outcome.affected,
            identities = outcome.identities.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "bulk call complete"
        ),
        Err(e) => tracing::debug!(error = %e, kind = %e.kind(), "bulk call failed"),
    }
    result
}

/// Checks that need no server round trip.
fn preflight(
    kind: OperationKind,
    table: &str,
    input: &BulkInput<'_>,
    options: &BulkOptions,
) -> Result<QualifiedName, BulkError> {
    let destination = QualifiedName::parse(table)?;
    if let Some(hints) = &options.hints {
        return Err(BulkError::DialectUnsupported(format!(
            "table hints ({hints})"
        )));
    }
    if kind.needs_qualifiers() {
        qualifier::precheck(&destination.to_string(), options.qualifiers.as_deref())?;
    }
    if options.batch_size == Some(0) {
        return Err(BulkError::InvalidArgument(
            "batch size must be greater than zero".into(),
        ));
    }
    if options.timeout == Some(Duration::ZERO) {
        return Err(BulkError::InvalidArgument(
            "timeout must be greater than zero".into(),
        ));
    }
    match (kind, input) {
        (OperationKind::DeleteByKey, BulkInput::Rows(_)) => Err(BulkError::InvalidArgument(
            "delete by key takes a list of key values".into(),
        )),
        (OperationKind::DeleteByKey, BulkInput::Keys(_)) | (_, BulkInput::Rows(_)) => {
            Ok(destination)
        }
        (other, BulkInput::Keys(_)) => Err(BulkError::InvalidArgument(format!(
            "{other} takes rows, not key values"
        ))),
    }
}

fn run_in_session<S: BulkSession>(
    session: &mut S,
    ctx: &BulkContext,
    kind: OperationKind,
    destination: &QualifiedName,
    input: BulkInput<'_>,
    options: &BulkOptions,
    progress: &mut Progress,
) -> Result<BulkOutcome, BulkError> {
    let config = ctx.config();
    let schema = if config.cache_schemas {
        ctx.schemas
            .get_or_fetch(destination, || session.fetch_schema(destination))?
    } else {
        let schema = session
            .fetch_schema(destination)?
            .ok_or_else(|| BulkError::TableNotFound(destination.to_string()))?;
        Arc::new(schema)
    };

    let mut keys;
    let source: &mut dyn RowSource = match input {
        BulkInput::Rows(rows) => rows,
        BulkInput::Keys(values) => {
            let column = key_column(&schema, options)?;
            keys = KeySource::new(Field::new(column), values);
            &mut keys
        }
    };

    let staging_owner = if options.use_physical_staging {
        Some(session.backend_pid()?)
    } else {
        None
    };
    let req = resolve_request(
        config,
        kind,
        destination,
        &schema,
        &source.fields(),
        options,
        staging_owner,
    )?;
    let commands: Arc<CommandSet> = if config.cache_commands {
        ctx.commands.get_or_compile(&req)?
    } else {
        Arc::new(compiler::compile(&req)?)
    };

    let timeout = options.timeout.or_else(|| config.command_timeout());
    if let Some(timeout) = timeout {
        session.set_statement_timeout(timeout)?;
    }

    staging::create(session, &req.staging, &commands.staging_ddl)?;
    progress.staged(&commands.teardown);

    let settings = StreamSettings {
        batch_size: options.batch_size.or(config.batch_size),
        deadline: timeout.map(|t| Instant::now() + t),
        cancellation: options.cancellation.clone(),
    };
    let staged = writer::stream_rows(session, &commands, &req, source, &settings)?;
    progress.advance(CallState::Imported);

    staging::analyze_if_needed(
        session,
        &req.staging,
        &commands.analyze,
        staged,
        config.analyze_threshold,
    )?;

    let reconciled = if staged == 0 {
        tracing::debug!("no rows staged, reconciliation skipped");
        Reconciled::default()
    } else {
        correlation::reconcile(session, &commands, &req, staged)?
    };
    progress.advance(CallState::Reconciled);

    if staging::teardown(session, &req.staging, &commands.teardown) {
        progress.dropped();
    }
    progress.advance(CallState::CleanedUp);

    Ok(BulkOutcome {
        affected: reconciled.affected,
        staged,
        identities: reconciled.identities,
    })
}

// ── Request resolution ─────────────────────────────────────────────────────

/// The single key column of a delete-by-key call: the one explicit
/// qualifier, or the single-column primary key.
fn key_column(schema: &TableSchema, options: &BulkOptions) -> Result<String, BulkError> {
    let table = schema.table.to_string();
    match options.qualifiers.as_deref() {
        Some([name]) => schema
            .column(name)
            .map(|c| c.name.clone())
            .ok_or_else(|| BulkError::MissingColumns {
                table,
                columns: vec![name.clone()],
            }),
        Some(_) => Err(BulkError::InvalidArgument(format!(
            "delete by key on {table} takes exactly one key column"
        ))),
        None => match schema.primary_keys().as_slice() {
            [] => Err(BulkError::MissingQualifier { table }),
            [pk] => Ok(pk.name.clone()),
            _ => Err(BulkError::InvalidArgument(format!(
                "delete by key on {table} needs a single-column key, the primary key is composite"
            ))),
        },
    }
}

/// Map source fields onto destination columns and resolve everything the
/// compiler needs.
///
/// `staging_owner` is the backend pid when staging into a physical relation.
pub fn resolve_request(
    config: &BulkConfig,
    kind: OperationKind,
    destination: &QualifiedName,
    schema: &TableSchema,
    fields: &[Field],
    options: &BulkOptions,
    staging_owner: Option<i32>,
) -> Result<BulkRequest, BulkError> {
    let table = destination.to_string();
    let mut mappings = select_mappings(&table, schema, fields, options.fields.as_deref())?;

    if mappings
        .iter()
        .any(|m| m.column.eq_ignore_ascii_case(&config.order_column))
    {
        return Err(BulkError::InvalidArgument(format!(
            "column {} of {table} collides with the order column",
            config.order_column
        )));
    }

    let primary_keys: Vec<String> = schema
        .primary_keys()
        .iter()
        .map(|c| c.name.clone())
        .collect();
    let qualifiers = if kind.needs_qualifiers() {
        qualifier::resolve(
            &table,
            options.qualifiers.as_deref(),
            &primary_keys,
            &mappings,
        )?
    } else {
        Vec::new()
    };
    if matches!(kind, OperationKind::Delete | OperationKind::DeleteByKey) {
        mappings.retain(|m| qualifiers.iter().any(|q| q.eq_ignore_ascii_case(&m.column)));
    }

    let identity = schema.identity().map(|c| IdentityColumn {
        name: c.name.clone(),
        generated_always: c.generated_always,
    });
    if options.identity_behavior == IdentityBehavior::ReturnIdentity
        && kind.supports_identity()
        && identity.is_none()
    {
        return Err(BulkError::IdentityRequired { table });
    }

    let mut merge_strategy = options.merge_strategy.unwrap_or(config.merge_strategy);
    if kind == OperationKind::Merge && merge_strategy == MergeStrategy::ConflictClause {
        let keyed_on_generated_identity = identity.as_ref().is_some_and(|id| {
            options.identity_behavior != IdentityBehavior::KeepIdentity
                && qualifiers.iter().any(|q| q.eq_ignore_ascii_case(&id.name))
        });
        if keyed_on_generated_identity {
            tracing::debug!(
                table = %table,
                "qualifiers include a generated identity, merging with insert-then-update"
            );
            merge_strategy = MergeStrategy::InsertThenUpdate;
        }
    }

    Ok(BulkRequest {
        kind,
        staging: StagingRelation::for_request(config, kind, destination, staging_owner),
        destination: destination.clone(),
        order_column: config.order_column.clone(),
        mappings,
        qualifiers,
        primary_keys,
        identity,
        identity_behavior: options.identity_behavior,
        merge_strategy,
        hints: options.hints.clone(),
    })
}

/// Source fields that map onto writable destination columns, in source
/// order. Stored generated columns are never written.
fn select_mappings(
    table: &str,
    schema: &TableSchema,
    fields: &[Field],
    selected: Option<&[String]>,
) -> Result<Vec<FieldMapping>, BulkError> {
    if let Some(selected) = selected {
        let missing: Vec<String> = selected
            .iter()
            .filter(|name| {
                !fields.iter().any(|f| f.is_named(name)) || schema.column(name).is_none()
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BulkError::MissingColumns {
                table: table.to_string(),
                columns: missing,
            });
        }
    }

    let mut mappings = Vec::with_capacity(fields.len());
    for (index, field) in fields.iter().enumerate() {
        if selected.is_some_and(|s| !s.iter().any(|name| field.is_named(name))) {
            continue;
        }
        if mappings
            .iter()
            .any(|m: &FieldMapping| m.column.eq_ignore_ascii_case(field.name()))
        {
            continue;
        }
        match schema.column(field.name()) {
            Some(column) if column.is_generated => {
                tracing::debug!(table, column = %column.name, "generated column not written");
            }
            Some(column) => mappings.push(FieldMapping::new(field, index, column)),
            None => tracing::trace!(table, field = %field, "field has no destination column"),
        }
    }

    if mappings.is_empty() {
        return Err(BulkError::NoFields {
            table: table.to_string(),
        });
    }
    Ok(mappings)
}
