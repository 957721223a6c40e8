//! Staging relation management.
//!
//! A staging relation receives the binary stream of one bulk call. It
//! mirrors the mapped destination columns, led by the OrderToken column,
//! and never outlives the call that created it.
//!
//! Temporary staging (the default) lives in `pg_temp` and is created with
//! `ON COMMIT DROP`. Physical staging is a regular table in the configured
//! schema, `UNLOGGED` unless configured otherwise, for environments where
//! temporary relations are unreliable. Physical names carry the backend pid
//! of the owning session, so concurrent sessions never share one.

use crate::compiler::{col_list, quote_ident};
use crate::config::BulkConfig;
use crate::error::{BulkError, Phase};
use crate::field::{FieldMapping, QualifiedName};
use crate::hash::hash_str;
use crate::request::OperationKind;
use crate::session::BulkSession;

/// PostgreSQL truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

const TEARDOWN_SAVEPOINT: &str = "pg_bulk_teardown";

/// The relation that receives the staged rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRelation {
    pub name: QualifiedName,
    pub temporary: bool,
    pub unlogged: bool,
}

impl StagingRelation {
    /// A session-scoped temporary relation.
    pub fn temporary(name: &str) -> Self {
        StagingRelation {
            name: QualifiedName::new(Some("pg_temp"), name),
            temporary: true,
            unlogged: false,
        }
    }

    /// A regular table in `schema`.
    pub fn physical(schema: &str, name: &str, unlogged: bool) -> Self {
        StagingRelation {
            name: QualifiedName::new(Some(schema), name),
            temporary: false,
            unlogged,
        }
    }

    /// The staging relation for one call: `{prefix}_{kind}_{table}`.
    ///
    /// `physical_owner` is the backend pid of a session staging into a
    /// physical relation, appended as `_{pid}`; `None` stages into a
    /// temporary relation.
    pub fn for_request(
        config: &BulkConfig,
        kind: OperationKind,
        destination: &QualifiedName,
        physical_owner: Option<i32>,
    ) -> Self {
        let name = staging_name(&config.staging_prefix, kind, destination, physical_owner);
        match physical_owner {
            Some(_) => Self::physical(
                &config.physical_staging_schema,
                &name,
                config.physical_staging_unlogged,
            ),
            None => Self::temporary(&name),
        }
    }
}

/// Build a staging name that fits PostgreSQL's identifier limit.
///
/// Long names are cut on a character boundary and suffixed with a hash of
/// the full name so distinct destinations keep distinct staging names.
fn staging_name(
    prefix: &str,
    kind: OperationKind,
    destination: &QualifiedName,
    owner: Option<i32>,
) -> String {
    let table = match &destination.schema {
        Some(schema) => format!("{schema}_{}", destination.name),
        None => destination.name.clone(),
    };
    let mut full = format!("{prefix}_{}_{table}", kind.as_str());
    if let Some(pid) = owner {
        full.push_str(&format!("_{pid}"));
    }
    if full.len() <= MAX_IDENTIFIER_LEN {
        return full;
    }
    let suffix = format!("_{:016x}", hash_str(&full));
    let mut cut = MAX_IDENTIFIER_LEN - suffix.len();
    while !full.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{suffix}", &full[..cut])
}

// ── SQL text ───────────────────────────────────────────────────────────────

/// `DROP TABLE IF EXISTS` followed by the `CREATE TABLE` for the staging
/// relation.
pub fn create_statements(
    staging: &StagingRelation,
    order_column: &str,
    mappings: &[FieldMapping],
) -> Vec<String> {
    let mut columns = Vec::with_capacity(mappings.len() + 1);
    columns.push(format!("{} bigint NOT NULL", quote_ident(order_column)));
    columns.extend(
        mappings
            .iter()
            .map(|m| format!("{} {}", quote_ident(&m.column), m.staged_type)),
    );
    let name = staging.name.quoted();
    let create = if staging.temporary {
        format!(
            "CREATE TEMPORARY TABLE {name} ({}) ON COMMIT DROP",
            columns.join(", ")
        )
    } else if staging.unlogged {
        format!("CREATE UNLOGGED TABLE {name} ({})", columns.join(", "))
    } else {
        format!("CREATE TABLE {name} ({})", columns.join(", "))
    };
    vec![drop_statement(staging), create]
}

pub fn copy_statement(
    staging: &StagingRelation,
    order_column: &str,
    mappings: &[FieldMapping],
) -> String {
    let mut columns = Vec::with_capacity(mappings.len() + 1);
    columns.push(order_column.to_string());
    columns.extend(mappings.iter().map(|m| m.column.clone()));
    format!(
        "COPY {} ({}) FROM STDIN (FORMAT BINARY)",
        staging.name.quoted(),
        col_list(&columns)
    )
}

pub fn analyze_statement(staging: &StagingRelation) -> String {
    format!("ANALYZE {}", staging.name.quoted())
}

pub fn drop_statement(staging: &StagingRelation) -> String {
    format!("DROP TABLE IF EXISTS {}", staging.name.quoted())
}

// ── Runtime ────────────────────────────────────────────────────────────────

/// Create the staging relation. Failure aborts the call before any row is
/// streamed.
pub fn create<S: BulkSession + ?Sized>(
    session: &mut S,
    staging: &StagingRelation,
    ddl: &[String],
) -> Result<(), BulkError> {
    let relation = staging.name.to_string();
    for sql in ddl {
        session.execute(Phase::Staging, &relation, sql)?;
    }
    tracing::debug!(
        staging = %relation,
        temporary = staging.temporary,
        "staging relation created"
    );
    Ok(())
}

/// Analyze the staging relation when enough rows were staged for the
/// planner statistics to matter.
pub fn analyze_if_needed<S: BulkSession + ?Sized>(
    session: &mut S,
    staging: &StagingRelation,
    sql: &str,
    staged: u64,
    threshold: u64,
) -> Result<bool, BulkError> {
    if threshold == 0 || staged < threshold {
        return Ok(false);
    }
    session.execute(Phase::Staging, &staging.name.to_string(), sql)?;
    tracing::debug!(staging = %staging.name, rows = staged, "staging relation analyzed");
    Ok(true)
}

/// Drop the staging relation inside the unit of work.
///
/// The drop runs under its own savepoint so a failure leaves the unit of
/// work usable. Failures are logged and reported as `false`, never raised:
/// they must not replace the result of the call.
pub fn teardown<S: BulkSession + ?Sized>(
    session: &mut S,
    staging: &StagingRelation,
    sql: &str,
) -> bool {
    let relation = staging.name.to_string();
    let result = session
        .execute(Phase::Cleanup, &relation, &format!("SAVEPOINT {TEARDOWN_SAVEPOINT}"))
        .and_then(|_| session.execute(Phase::Cleanup, &relation, sql));
    match result {
        Ok(_) => {
            if let Err(e) = session.execute(
                Phase::Cleanup,
                &relation,
                &format!("RELEASE SAVEPOINT {TEARDOWN_SAVEPOINT}"),
            ) {
                tracing::warn!(staging = %relation, error = %e, "failed to release teardown savepoint");
                return false;
            }
            tracing::debug!(staging = %relation, "staging relation dropped");
            true
        }
        Err(e) => {
            tracing::warn!(staging = %relation, error = %e, "failed to drop staging relation");
            if let Err(e) = session.execute(
                Phase::Cleanup,
                &relation,
                &format!("ROLLBACK TO SAVEPOINT {TEARDOWN_SAVEPOINT}"),
            ) {
                tracing::warn!(staging = %relation, error = %e, "failed to roll back teardown savepoint");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{DbColumn, Field};
    use crate::test_helpers::{Recorder, RecordingSession};

    fn mappings() -> Vec<FieldMapping> {
        vec![
            FieldMapping::new(&Field::new("id"), 0, &DbColumn::new("id", "integer")),
            FieldMapping::new(
                &Field::new("name"),
                1,
                &DbColumn {
                    base_type: "varchar".into(),
                    ..DbColumn::new("name", "character varying(40)")
                },
            ),
        ]
    }

    #[test]
    fn test_temporary_create_statements() {
        let staging = StagingRelation::temporary("__bulk_insert_person");
        let ddl = create_statements(&staging, "__bulk_order", &mappings());
        assert_eq!(ddl.len(), 2);
        assert_eq!(ddl[0], "DROP TABLE IF EXISTS \"pg_temp\".\"__bulk_insert_person\"");
        assert_eq!(
            ddl[1],
            "CREATE TEMPORARY TABLE \"pg_temp\".\"__bulk_insert_person\" \
             (\"__bulk_order\" bigint NOT NULL, \"id\" integer, \"name\" character varying(40)) \
             ON COMMIT DROP"
        );
    }

    #[test]
    fn test_physical_create_statements() {
        let staging = StagingRelation::physical("staging", "__bulk_merge_person", true);
        let ddl = create_statements(&staging, "__bulk_order", &mappings());
        assert!(ddl[1].starts_with("CREATE UNLOGGED TABLE \"staging\".\"__bulk_merge_person\" ("));

        let logged = StagingRelation::physical("staging", "__bulk_merge_person", false);
        let ddl = create_statements(&logged, "__bulk_order", &mappings());
        assert!(ddl[1].starts_with("CREATE TABLE \"staging\".\"__bulk_merge_person\" ("));
    }

    #[test]
    fn test_for_request_names() {
        let config = BulkConfig::default();
        let dest = QualifiedName::new(Some("sales"), "orders");
        let temp = StagingRelation::for_request(&config, OperationKind::Merge, &dest, None);
        assert_eq!(temp.name.name, "__bulk_merge_sales_orders");
        assert!(temp.temporary);

        let phys = StagingRelation::for_request(&config, OperationKind::Delete, &dest, Some(812));
        assert_eq!(phys.name.schema.as_deref(), Some("public"));
        assert_eq!(phys.name.name, "__bulk_delete_sales_orders_812");
        assert!(phys.unlogged);
        assert!(!phys.temporary);
    }

    #[test]
    fn test_physical_names_differ_per_session() {
        let config = BulkConfig::default();
        let dest = QualifiedName::new(None, "orders");
        let a = StagingRelation::for_request(&config, OperationKind::Insert, &dest, Some(101));
        let b = StagingRelation::for_request(&config, OperationKind::Insert, &dest, Some(102));
        assert_ne!(a.name, b.name);

        let long = QualifiedName::new(None, &"o".repeat(80));
        let a = staging_name("__bulk", OperationKind::Insert, &long, Some(101));
        let b = staging_name("__bulk", OperationKind::Insert, &long, Some(102));
        assert!(a.len() <= MAX_IDENTIFIER_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_long_names_fit_identifier_limit() {
        let a = QualifiedName::new(None, &"a".repeat(80));
        let b = QualifiedName::new(None, &format!("{}b", "a".repeat(79)));
        let na = staging_name("__bulk", OperationKind::Insert, &a, None);
        let nb = staging_name("__bulk", OperationKind::Insert, &b, None);
        assert!(na.len() <= MAX_IDENTIFIER_LEN);
        assert!(nb.len() <= MAX_IDENTIFIER_LEN);
        assert_ne!(na, nb);

        let shape = regex_lite::Regex::new(r"^__bulk_insert_a+_[0-9a-f]{16}$").unwrap();
        assert!(shape.is_match(&na), "{na}");
    }

    #[test]
    fn test_long_multibyte_name_cut_on_char_boundary() {
        let dest = QualifiedName::new(None, &"é".repeat(40));
        let name = staging_name("__bulk", OperationKind::Update, &dest, None);
        assert!(name.len() <= MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn test_copy_and_analyze_statements() {
        let staging = StagingRelation::temporary("s");
        assert_eq!(
            copy_statement(&staging, "__bulk_order", &mappings()),
            "COPY \"pg_temp\".\"s\" (\"__bulk_order\", \"id\", \"name\") FROM STDIN (FORMAT BINARY)"
        );
        assert_eq!(analyze_statement(&staging), "ANALYZE \"pg_temp\".\"s\"");
    }

    #[test]
    fn test_analyze_threshold() {
        let recorder = Recorder::new();
        let mut session = RecordingSession::new(recorder.clone());
        let staging = StagingRelation::temporary("s");
        assert!(!analyze_if_needed(&mut session, &staging, "ANALYZE x", 5, 10).unwrap());
        assert!(!analyze_if_needed(&mut session, &staging, "ANALYZE x", 50, 0).unwrap());
        assert!(analyze_if_needed(&mut session, &staging, "ANALYZE x", 10, 10).unwrap());
        assert_eq!(recorder.statements(), vec!["ANALYZE x"]);
    }

    #[test]
    fn test_teardown_failure_is_swallowed() {
        let recorder = Recorder::new();
        recorder.fail_on("DROP TABLE");
        let mut session = RecordingSession::new(recorder.clone());
        let staging = StagingRelation::temporary("s");
        assert!(!teardown(&mut session, &staging, &drop_statement(&staging)));
        assert_eq!(
            recorder.statements(),
            vec![
                "SAVEPOINT pg_bulk_teardown".to_string(),
                "DROP TABLE IF EXISTS \"pg_temp\".\"s\"".to_string(),
                "ROLLBACK TO SAVEPOINT pg_bulk_teardown".to_string(),
            ]
        );
    }

    #[test]
    fn test_teardown_releases_savepoint() {
        let recorder = Recorder::new();
        let mut session = RecordingSession::new(recorder.clone());
        let staging = StagingRelation::temporary("s");
        assert!(teardown(&mut session, &staging, &drop_statement(&staging)));
        assert_eq!(
            recorder.statements().last().map(String::as_str),
            Some("RELEASE SAVEPOINT pg_bulk_teardown")
        );
    }
}
