//! Recording fakes for the session seams.
//!
//! A [`Recorder`] collects every statement, COPY row and transaction event
//! of a fake session, and lets a test script failures and result sets by
//! SQL substring. Nothing here talks to PostgreSQL.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{BulkError, Phase};
use crate::field::{QualifiedName, TableSchema, WireType};
use crate::request::IdentityResult;
use crate::session::{BulkConnection, BulkSession};
use crate::value::Value;
use crate::writer::RowSink;

/// Backend pid reported by every recording session.
pub const RECORDING_PID: i32 = 4242;

#[derive(Debug, Default)]
struct State {
    statements: Vec<String>,
    events: Vec<String>,
    failures: Vec<String>,
    identities: Vec<(String, Vec<IdentityResult>)>,
    affected: Vec<(String, u64)>,
    schema: Option<TableSchema>,
    copied: Vec<Vec<Value>>,
    copies: usize,
}

impl State {
    fn fails(&self, sql: &str) -> bool {
        self.failures.iter().any(|pat| sql.contains(pat.as_str()))
    }
}

/// Shared, clonable log of what a fake session did.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    state: Rc<RefCell<State>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement whose text contains `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.state.borrow_mut().failures.push(pattern.to_string());
    }

    /// Answer identity queries containing `pattern` with `rows`.
    pub fn respond_identities(&self, pattern: &str, rows: Vec<IdentityResult>) {
        self.state
            .borrow_mut()
            .identities
            .push((pattern.to_string(), rows));
    }

    /// Report `count` affected rows for statements containing `pattern`.
    pub fn respond_affected(&self, pattern: &str, count: u64) {
        self.state
            .borrow_mut()
            .affected
            .push((pattern.to_string(), count));
    }

    pub fn set_schema(&self, schema: TableSchema) {
        self.state.borrow_mut().schema = Some(schema);
    }

    pub fn with_schema(self, schema: TableSchema) -> Self {
        self.set_schema(schema);
        self
    }

    /// Executed SQL text in order, COPY commands included.
    pub fn statements(&self) -> Vec<String> {
        self.state.borrow().statements.clone()
    }

    /// Transaction events: `begin`, `timeout:<ms>`, `commit`, `rollback`,
    /// `cleanup:<sql>`.
    pub fn events(&self) -> Vec<String> {
        self.state.borrow().events.clone()
    }

    /// Every row received by a sink, across all COPY commands.
    pub fn copied(&self) -> Vec<Vec<Value>> {
        self.state.borrow().copied.clone()
    }

    /// Number of completed COPY commands.
    pub fn copies(&self) -> usize {
        self.state.borrow().copies
    }

    fn event(&self, event: String) {
        self.state.borrow_mut().events.push(event);
    }

    /// Log `sql`, then fail it if a failure pattern matches.
    fn run(&self, phase: Phase, relation: &str, sql: &str) -> Result<(), BulkError> {
        let mut state = self.state.borrow_mut();
        state.statements.push(sql.to_string());
        if state.fails(sql) {
            return Err(injected(phase, relation));
        }
        Ok(())
    }
}

fn injected(phase: Phase, relation: &str) -> BulkError {
    let message = "injected failure".to_string();
    match phase {
        Phase::Reconcile => BulkError::Reconciliation {
            table: relation.to_string(),
            message,
        },
        Phase::Staging => BulkError::Staging {
            relation: relation.to_string(),
            message,
        },
        Phase::Import => BulkError::Protocol {
            relation: relation.to_string(),
            message,
        },
        _ => BulkError::Connection(format!("{phase} on {relation}: {message}")),
    }
}

// ── Session ────────────────────────────────────────────────────────────────

/// A [`BulkSession`] that records instead of executing.
pub struct RecordingSession {
    recorder: Recorder,
}

impl RecordingSession {
    pub fn new(recorder: Recorder) -> Self {
        RecordingSession { recorder }
    }
}

impl BulkSession for RecordingSession {
    fn fetch_schema(&mut self, table: &QualifiedName) -> Result<Option<TableSchema>, BulkError> {
        let state = self.recorder.state.borrow();
        Ok(state
            .schema
            .as_ref()
            .filter(|s| s.table.cache_key() == table.cache_key())
            .cloned())
    }

    fn backend_pid(&mut self) -> Result<i32, BulkError> {
        Ok(RECORDING_PID)
    }

    fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), BulkError> {
        self.recorder
            .event(format!("timeout:{}", timeout.as_millis()));
        Ok(())
    }

    fn execute(&mut self, phase: Phase, relation: &str, sql: &str) -> Result<u64, BulkError> {
        self.recorder.run(phase, relation, sql)?;
        let state = self.recorder.state.borrow();
        Ok(state
            .affected
            .iter()
            .find(|(pat, _)| sql.contains(pat.as_str()))
            .map(|(_, n)| *n)
            .unwrap_or(0))
    }

    fn query_identities(
        &mut self,
        phase: Phase,
        relation: &str,
        sql: &str,
    ) -> Result<Vec<IdentityResult>, BulkError> {
        self.recorder.run(phase, relation, sql)?;
        let state = self.recorder.state.borrow();
        Ok(state
            .identities
            .iter()
            .find(|(pat, _)| sql.contains(pat.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    fn copy_in(
        &mut self,
        relation: &str,
        sql: &str,
        _types: &[WireType],
    ) -> Result<Box<dyn RowSink + '_>, BulkError> {
        self.recorder.run(Phase::Import, relation, sql)?;
        Ok(Box::new(RecordingSink::new(self.recorder.clone())))
    }

    fn commit(self) -> Result<(), BulkError> {
        self.recorder.event("commit".into());
        Ok(())
    }

    fn rollback(self) -> Result<(), BulkError> {
        self.recorder.event("rollback".into());
        Ok(())
    }
}

/// A [`RowSink`] that buffers rows and hands them to the recorder when the
/// stream completes.
pub struct RecordingSink {
    recorder: Recorder,
    rows: Vec<Vec<Value>>,
}

impl RecordingSink {
    pub fn new(recorder: Recorder) -> Self {
        RecordingSink {
            recorder,
            rows: Vec::new(),
        }
    }
}

impl RowSink for RecordingSink {
    fn start_row(&mut self) -> Result<(), BulkError> {
        self.rows.push(Vec::new());
        Ok(())
    }

    fn write_field(&mut self, value: Value, _wire: WireType) -> Result<(), BulkError> {
        match self.rows.last_mut() {
            Some(row) => {
                row.push(value);
                Ok(())
            }
            None => Err(BulkError::Internal("field written before row start".into())),
        }
    }

    fn write_null(&mut self, wire: WireType) -> Result<(), BulkError> {
        self.write_field(Value::Null, wire)
    }

    fn complete(self: Box<Self>) -> Result<u64, BulkError> {
        let count = self.rows.len() as u64;
        let mut state = self.recorder.state.borrow_mut();
        state.copied.extend(self.rows);
        state.copies += 1;
        Ok(count)
    }
}

// ── Connection ─────────────────────────────────────────────────────────────

/// A [`BulkConnection`] handing out [`RecordingSession`]s.
#[derive(Debug, Clone, Default)]
pub struct RecordingConnection {
    recorder: Recorder,
}

impl RecordingConnection {
    pub fn new(recorder: Recorder) -> Self {
        RecordingConnection { recorder }
    }
}

impl BulkConnection for RecordingConnection {
    type Session<'s>
        = RecordingSession
    where
        Self: 's;

    fn begin(&mut self) -> Result<RecordingSession, BulkError> {
        self.recorder.event("begin".into());
        Ok(RecordingSession::new(self.recorder.clone()))
    }

    fn cleanup(&mut self, sql: &str) -> Result<(), BulkError> {
        self.recorder.event(format!("cleanup:{sql}"));
        if self.recorder.state.borrow().fails(sql) {
            return Err(injected(Phase::Cleanup, sql));
        }
        Ok(())
    }
}
