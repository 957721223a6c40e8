//! Identity correlation: tying server-generated identities back to the
//! input rows they came from.
//!
//! Reconciliation statements that can report identities project
//! `(__index, __identity)` where `__index` is the OrderToken of the staged
//! row. The general correlation query fills whatever those statements did
//! not report. Both feed an [`IdentityAccumulator`] keyed by OrderToken, so
//! every index appears at most once in the result.

use std::collections::BTreeMap;

use crate::compiler::CommandSet;
use crate::error::{BulkError, Phase};
use crate::request::{BulkRequest, IdentityResult};
use crate::session::BulkSession;
use crate::value::Value;

// ── Accumulator ────────────────────────────────────────────────────────────

/// Identities keyed by OrderToken, bounded by the staged row count.
#[derive(Debug, Clone, Default)]
pub struct IdentityAccumulator {
    limit: u64,
    entries: BTreeMap<i64, Value>,
}

impl IdentityAccumulator {
    /// An accumulator for `staged` input rows (indices `0..staged`).
    pub fn new(staged: u64) -> Self {
        IdentityAccumulator {
            limit: staged,
            entries: BTreeMap::new(),
        }
    }

    fn in_range(&self, index: i64) -> bool {
        u64::try_from(index).is_ok_and(|i| i < self.limit)
    }

    /// Record a directly reported identity, replacing an earlier one.
    ///
    /// Returns `false` when the index is uncorrelated or out of range.
    pub fn record(&mut self, result: IdentityResult) -> bool {
        if !self.in_range(result.index) {
            return false;
        }
        self.entries.insert(result.index, result.identity);
        true
    }

    /// Fill an index nothing has reported yet. Reported identities win.
    pub fn fill(&mut self, result: IdentityResult) -> bool {
        if !self.in_range(result.index) {
            return false;
        }
        let mut inserted = false;
        self.entries.entry(result.index).or_insert_with(|| {
            inserted = true;
            result.identity
        });
        inserted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Results ordered by index. Placeholders that never received a
    /// non-NULL identity are dropped.
    pub fn into_results(self) -> Vec<IdentityResult> {
        self.entries
            .into_iter()
            .filter(|(_, identity)| !identity.is_null())
            .map(|(index, identity)| IdentityResult::new(index, identity))
            .collect()
    }
}

// ── Reconciliation ─────────────────────────────────────────────────────────

/// What reconciliation did to the destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    pub affected: u64,
    pub identities: Vec<IdentityResult>,
}

/// Run the reconciliation statements of `commands` against the staged rows
/// and correlate identities when the request asks for them.
///
/// Statements run in order inside the caller's unit of work. The first
/// failure is returned unchanged; nothing is committed here.
pub fn reconcile<S: BulkSession + ?Sized>(
    session: &mut S,
    commands: &CommandSet,
    req: &BulkRequest,
    staged: u64,
) -> Result<Reconciled, BulkError> {
    let table = req.destination.to_string();
    let mut affected = 0u64;
    let mut acc = IdentityAccumulator::new(staged);

    for stmt in &commands.reconcile {
        if stmt.yields_identities {
            let rows = session.query_identities(Phase::Reconcile, &table, &stmt.sql)?;
            affected += rows.len() as u64;
            let reported = rows.len();
            let mut skipped = 0usize;
            for row in rows {
                if !acc.record(row) {
                    skipped += 1;
                }
            }
            tracing::debug!(
                table = %table,
                statement = stmt.kind.as_str(),
                rows = reported,
                skipped,
                "reconciled with identities"
            );
        } else {
            let rows = session.execute(Phase::Reconcile, &table, &stmt.sql)?;
            affected += rows;
            tracing::debug!(
                table = %table,
                statement = stmt.kind.as_str(),
                rows,
                "reconciled"
            );
        }
    }

    if !req.returns_identity() {
        return Ok(Reconciled {
            affected,
            identities: Vec::new(),
        });
    }

    if let Some(sql) = &commands.correlate {
        let rows = session.query_identities(Phase::Reconcile, &table, sql)?;
        let filled = rows.into_iter().filter(|r| acc.fill(r.clone())).count();
        tracing::debug!(table = %table, filled, "identities correlated");
    }

    let identities = acc.into_results();
    if (identities.len() as u64) < staged {
        tracing::debug!(
            table = %table,
            staged,
            correlated = identities.len(),
            "some rows have no identity"
        );
    }
    Ok(Reconciled {
        affected,
        identities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::field::{DbColumn, Field, FieldMapping, QualifiedName};
    use crate::request::{IdentityBehavior, IdentityColumn, MergeStrategy, OperationKind};
    use crate::staging::StagingRelation;
    use crate::test_helpers::{Recorder, RecordingSession};

    fn request(kind: OperationKind, behavior: IdentityBehavior) -> BulkRequest {
        let id = DbColumn::new("id", "integer").primary().identity();
        BulkRequest {
            kind,
            staging: StagingRelation::temporary(&format!("__bulk_{}_person", kind.as_str())),
            destination: QualifiedName::new(None, "person"),
            order_column: "__bulk_order".into(),
            mappings: vec![
                FieldMapping::new(&Field::new("email"), 0, &DbColumn::new("email", "text")),
                FieldMapping::new(&Field::new("name"), 1, &DbColumn::new("name", "text")),
            ],
            qualifiers: vec!["email".into()],
            primary_keys: vec![id.name.clone()],
            identity: Some(IdentityColumn {
                name: id.name,
                generated_always: false,
            }),
            identity_behavior: behavior,
            merge_strategy: MergeStrategy::InsertThenUpdate,
            hints: None,
        }
    }

    #[test]
    fn test_accumulator_bounds() {
        let mut acc = IdentityAccumulator::new(2);
        assert!(acc.record(IdentityResult::new(0, Value::Int32(1))));
        assert!(!acc.record(IdentityResult::new(2, Value::Int32(3))));
        assert!(!acc.record(IdentityResult::uncorrelated(Value::Int32(4))));
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_accumulator_record_overwrites_fill_does_not() {
        let mut acc = IdentityAccumulator::new(3);
        acc.record(IdentityResult::new(1, Value::Int32(10)));
        acc.record(IdentityResult::new(1, Value::Int32(11)));
        assert!(!acc.fill(IdentityResult::new(1, Value::Int32(99))));
        assert!(acc.fill(IdentityResult::new(0, Value::Int32(5))));
        assert_eq!(
            acc.into_results(),
            vec![
                IdentityResult::new(0, Value::Int32(5)),
                IdentityResult::new(1, Value::Int32(11)),
            ]
        );
    }

    #[test]
    fn test_accumulator_drops_null_placeholders() {
        let mut acc = IdentityAccumulator::new(2);
        acc.record(IdentityResult::new(0, Value::Null));
        acc.fill(IdentityResult::new(1, Value::Int64(7)));
        assert_eq!(acc.into_results(), vec![IdentityResult::new(1, Value::Int64(7))]);
    }

    #[test]
    fn test_reconcile_counts_without_identities() {
        let req = request(OperationKind::Merge, IdentityBehavior::Ignore);
        let commands = compile(&req).unwrap();
        let recorder = Recorder::new();
        recorder.respond_affected("UPDATE", 1);
        recorder.respond_affected("INSERT", 1);
        let mut session = RecordingSession::new(recorder.clone());

        let out = reconcile(&mut session, &commands, &req, 2).unwrap();
        assert_eq!(out.affected, 2);
        assert!(out.identities.is_empty());
        assert_eq!(recorder.statements().len(), 2);
    }

    #[test]
    fn test_insert_then_update_merges_both_phases() {
        let req = request(OperationKind::Merge, IdentityBehavior::ReturnIdentity);
        let commands = compile(&req).unwrap();
        let recorder = Recorder::new();
        recorder.respond_identities("UPDATE", vec![IdentityResult::new(0, Value::Int32(10))]);
        recorder.respond_identities("WITH __pending", vec![IdentityResult::new(1, Value::Int32(11))]);
        // The correlation query sees both rows; it must not override them.
        recorder.respond_identities(
            "ROW_NUMBER() OVER (PARTITION BY",
            vec![
                IdentityResult::new(0, Value::Int32(99)),
                IdentityResult::new(1, Value::Int32(98)),
            ],
        );
        let mut session = RecordingSession::new(recorder.clone());

        let out = reconcile(&mut session, &commands, &req, 2).unwrap();
        assert_eq!(out.affected, 2);
        assert_eq!(
            out.identities,
            vec![
                IdentityResult::new(0, Value::Int32(10)),
                IdentityResult::new(1, Value::Int32(11)),
            ]
        );
        assert_eq!(recorder.statements().len(), 3);
    }

    #[test]
    fn test_update_identities_come_from_correlation() {
        let req = request(OperationKind::Update, IdentityBehavior::ReturnIdentity);
        let commands = compile(&req).unwrap();
        let recorder = Recorder::new();
        recorder.respond_affected("UPDATE", 1);
        recorder.respond_identities(
            "ROW_NUMBER() OVER (PARTITION BY",
            vec![IdentityResult::new(1, Value::Int32(42))],
        );
        let mut session = RecordingSession::new(recorder);

        let out = reconcile(&mut session, &commands, &req, 2).unwrap();
        assert_eq!(out.affected, 1);
        assert_eq!(out.identities, vec![IdentityResult::new(1, Value::Int32(42))]);
    }

    #[test]
    fn test_reconcile_failure_propagates() {
        let req = request(OperationKind::Delete, IdentityBehavior::Ignore);
        let commands = compile(&req).unwrap();
        let recorder = Recorder::new();
        recorder.fail_on("DELETE");
        let mut session = RecordingSession::new(recorder);

        let err = reconcile(&mut session, &commands, &req, 1).unwrap_err();
        assert!(matches!(err, BulkError::Reconciliation { .. }));
    }
}
