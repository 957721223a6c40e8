//! Binary row writer.
//!
//! Streams source rows into the staging relation through a [`RowSink`],
//! one field per mapped column in mapping order, OrderToken first.
//!
//! The writer enforces the row protocol at runtime:
//!
//! ```text
//! Idle → RowStarted → (write)* → RowComplete → (RowStarted | Finished)
//! ```
//!
//! Cancellation and the streaming deadline are only checked before a row
//! starts, never inside one, so an aborted stream never leaves a partial
//! row on the wire.

use std::time::Instant;

use crate::compiler::CommandSet;
use crate::error::{BulkError, Phase};
use crate::field::WireType;
use crate::request::{BulkRequest, CancellationToken};
use crate::session::BulkSession;
use crate::source::RowSource;
use crate::value::Value;

/// Destination of a binary row stream. Each backend supplies one.
///
/// Values handed to a sink are already coerced to `wire`. A sink that is
/// dropped without [`complete`](RowSink::complete) must abort the import.
pub trait RowSink {
    fn start_row(&mut self) -> Result<(), BulkError>;
    fn write_field(&mut self, value: Value, wire: WireType) -> Result<(), BulkError>;
    fn write_null(&mut self, wire: WireType) -> Result<(), BulkError>;
    /// Flush the stream and return the number of rows the server accepted.
    fn complete(self: Box<Self>) -> Result<u64, BulkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    RowStarted,
    RowComplete,
    Finished,
}

/// Row protocol state machine over a sink.
pub struct RowWriter<'s> {
    sink: Option<Box<dyn RowSink + 's>>,
    state: WriterState,
    width: usize,
    fields_in_row: usize,
    rows: u64,
}

impl<'s> RowWriter<'s> {
    /// `width` is the number of fields per row, OrderToken included.
    pub fn new(sink: Box<dyn RowSink + 's>, width: usize) -> Self {
        RowWriter {
            sink: Some(sink),
            state: WriterState::Idle,
            width,
            fields_in_row: 0,
            rows: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn sink(&mut self) -> Result<&mut Box<dyn RowSink + 's>, BulkError> {
        self.sink
            .as_mut()
            .ok_or_else(|| BulkError::Internal("row writer already finished".into()))
    }

    fn transition(&self, expected: &[WriterState], action: &str) -> Result<(), BulkError> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(BulkError::Internal(format!(
                "cannot {action} in writer state {:?}",
                self.state
            )))
        }
    }

    pub fn start_row(&mut self) -> Result<(), BulkError> {
        self.transition(&[WriterState::Idle, WriterState::RowComplete], "start a row")?;
        self.sink()?.start_row()?;
        self.state = WriterState::RowStarted;
        self.fields_in_row = 0;
        Ok(())
    }

    /// Coerce `value` to `wire` and write it, or write a typed NULL.
    pub fn write(&mut self, value: Value, wire: WireType, column: &str) -> Result<(), BulkError> {
        self.transition(&[WriterState::RowStarted], "write a field")?;
        if self.fields_in_row >= self.width {
            return Err(BulkError::Internal(format!(
                "row has more than {} fields",
                self.width
            )));
        }
        let value = value.coerce(wire, column)?;
        let sink = self.sink()?;
        if value.is_null() {
            sink.write_null(wire)?;
        } else {
            sink.write_field(value, wire)?;
        }
        self.fields_in_row += 1;
        Ok(())
    }

    pub fn end_row(&mut self) -> Result<(), BulkError> {
        self.transition(&[WriterState::RowStarted], "end a row")?;
        if self.fields_in_row != self.width {
            return Err(BulkError::Internal(format!(
                "row ended after {} of {} fields",
                self.fields_in_row, self.width
            )));
        }
        self.state = WriterState::RowComplete;
        self.rows += 1;
        Ok(())
    }

    /// Complete the stream. Returns the row count reported by the sink.
    pub fn finish(&mut self) -> Result<u64, BulkError> {
        self.transition(&[WriterState::Idle, WriterState::RowComplete], "finish")?;
        let sink = self
            .sink
            .take()
            .ok_or_else(|| BulkError::Internal("row writer already finished".into()))?;
        let accepted = sink.complete()?;
        self.state = WriterState::Finished;
        Ok(accepted)
    }
}

// ── Streaming ──────────────────────────────────────────────────────────────

/// Row-boundary limits for one streaming phase.
#[derive(Debug, Clone, Default)]
pub struct StreamSettings {
    /// Rows per COPY command; `None` streams everything in one command.
    pub batch_size: Option<usize>,
    pub deadline: Option<Instant>,
    pub cancellation: Option<CancellationToken>,
}

impl StreamSettings {
    fn check(&self, rows_written: u64) -> Result<(), BulkError> {
        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(BulkError::Cancelled { rows_written });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(BulkError::Timeout {
                phase: Phase::Import,
            });
        }
        Ok(())
    }
}

/// Stream every row of `source` into the staging relation of `req`.
///
/// OrderTokens are zero-based input positions and continue across COPY
/// batches. Returns the number of staged rows. With zero input rows no
/// COPY command is issued.
pub fn stream_rows<S: BulkSession + ?Sized>(
    session: &mut S,
    commands: &CommandSet,
    req: &BulkRequest,
    source: &mut dyn RowSource,
    settings: &StreamSettings,
) -> Result<u64, BulkError> {
    let relation = req.staging.name.to_string();
    let width = req.mappings.len() + 1;
    let mut order: i64 = 0;
    let mut batches = 0usize;

    settings.check(0)?;
    let mut next = source.next_row()?;
    while next.is_some() {
        let sink = session.copy_in(&relation, &commands.copy_in, &commands.copy_types)?;
        let mut writer = RowWriter::new(sink, width);
        let mut in_batch = 0usize;

        while let Some(mut values) = next.take() {
            settings.check(order as u64)?;
            writer.start_row()?;
            writer.write(Value::Int64(order), WireType::Int8, &req.order_column)?;
            for m in &req.mappings {
                let value = values
                    .get_mut(m.source_index)
                    .map(|v| std::mem::replace(v, Value::Null))
                    .unwrap_or(Value::Null);
                writer.write(value, m.wire, &m.column)?;
            }
            writer.end_row()?;
            order += 1;
            in_batch += 1;

            next = source.next_row()?;
            if settings.batch_size.is_some_and(|limit| in_batch >= limit) {
                break;
            }
        }

        let written = writer.rows();
        let accepted = writer.finish()?;
        if accepted != written {
            return Err(BulkError::Protocol {
                relation,
                message: format!("server accepted {accepted} of {written} rows"),
            });
        }
        batches += 1;
        tracing::trace!(staging = %relation, batch = batches, rows = written, "batch copied");
    }

    tracing::debug!(staging = %relation, rows = order, batches, "rows streamed");
    Ok(order as u64)
}
