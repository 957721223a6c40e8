//! Process-wide caches for compiled command text and table schemas.
//!
//! Both caches are concurrent maps behind an `Arc`, so clones share
//! entries. Entries are only ever added; they change only through an
//! explicit [`clear`](CommandCache::clear) or `invalidate`.

use std::sync::Arc;

use dashmap::DashMap;

use crate::compiler::{self, CommandSet};
use crate::error::BulkError;
use crate::field::{QualifiedName, TableSchema};
use crate::request::BulkRequest;

// ── Command text ───────────────────────────────────────────────────────────

/// Compiled [`CommandSet`]s keyed by [`BulkRequest::cache_key`].
#[derive(Debug, Clone, Default)]
pub struct CommandCache {
    entries: Arc<DashMap<u64, Arc<CommandSet>>>,
}

impl CommandCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached command set for `req`, compiling it on a miss.
    ///
    /// Compilation errors are returned and nothing is cached.
    pub fn get_or_compile(&self, req: &BulkRequest) -> Result<Arc<CommandSet>, BulkError> {
        let key = req.cache_key();
        if let Some(hit) = self.entries.get(&key) {
            tracing::trace!(key, table = %req.destination, "command cache hit");
            return Ok(Arc::clone(hit.value()));
        }
        let compiled = Arc::new(compiler::compile(req)?);
        tracing::debug!(
            key,
            table = %req.destination,
            operation = %req.kind,
            statements = compiled.statement_count(),
            "command cache miss, compiled"
        );
        // A concurrent miss may have inserted the same text first; keep theirs.
        let entry = self.entries.entry(key).or_insert(compiled);
        Ok(Arc::clone(entry.value()))
    }

    pub fn get(&self, req: &BulkRequest) -> Option<Arc<CommandSet>> {
        self.entries
            .get(&req.cache_key())
            .map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every command set that targets `table`.
    pub fn invalidate(&self, table: &QualifiedName) -> usize {
        let key = table.cache_key();
        let before = self.entries.len();
        self.entries.retain(|_, set| set.destination != key);
        before - self.entries.len()
    }
}

// ── Table schemas ──────────────────────────────────────────────────────────

/// Destination snapshots keyed by lower-cased relation name.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    entries: Arc<DashMap<String, Arc<TableSchema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached snapshot of `table`, or fetch and cache it.
    ///
    /// `fetch` returning `None` means the table does not exist; nothing is
    /// cached and [`BulkError::TableNotFound`] is returned.
    pub fn get_or_fetch<F>(&self, table: &QualifiedName, fetch: F) -> Result<Arc<TableSchema>, BulkError>
    where
        F: FnOnce() -> Result<Option<TableSchema>, BulkError>,
    {
        let key = table.cache_key();
        if let Some(hit) = self.entries.get(&key) {
            tracing::trace!(table = %table, "schema cache hit");
            return Ok(Arc::clone(hit.value()));
        }
        let schema = fetch()?.ok_or_else(|| BulkError::TableNotFound(table.to_string()))?;
        tracing::debug!(table = %table, columns = schema.columns.len(), "schema cached");
        let entry = self.entries.entry(key).or_insert(Arc::new(schema));
        Ok(Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Forget the snapshot of `table`, e.g. after `ALTER TABLE`.
    pub fn invalidate(&self, table: &QualifiedName) -> bool {
        self.entries.remove(&table.cache_key()).is_some()
    }
}
