//! Command text compiler.
//!
//! Turns a resolved [`BulkRequest`] into the SQL text for one bulk call:
//! staging DDL, the binary COPY command, the reconciliation statements for
//! the operation kind and merge strategy, the identity correlation query
//! and the teardown DDL.
//!
//! Every statement reads the staging relation through the alias `s` and
//! the destination through `d`. Columns without a native binary encoder
//! are staged as text and cast back to the destination type wherever a
//! staged value is compared or written.
//!
//! Statements that report identities always project the same two columns,
//! `__index` (the OrderToken) and `__identity`, so the correlation step
//! can read every result set the same way.

use crate::error::BulkError;
use crate::field::{FieldMapping, WireType};
use crate::request::{BulkRequest, MergeStrategy, OperationKind};
use crate::staging;

// ── Compiled output ────────────────────────────────────────────────────────

/// What a reconciliation statement does to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Upsert,
    Update,
    Delete,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Insert => "insert",
            StatementKind::Upsert => "upsert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
        }
    }
}

/// One set-based statement run against the staged rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileStatement {
    pub kind: StatementKind,
    pub sql: String,
    /// The statement returns `(__index, __identity)` rows instead of a
    /// bare row count. The number of returned rows is the affected count.
    pub yields_identities: bool,
}

/// All SQL text for one request shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    /// Lower-cased destination name, for cache invalidation.
    pub destination: String,
    /// Executed in order to (re)create the staging relation.
    pub staging_ddl: Vec<String>,
    /// `COPY ... FROM STDIN (FORMAT BINARY)` into the staging relation.
    pub copy_in: String,
    /// Wire types of the COPY columns, OrderToken first.
    pub copy_types: Vec<WireType>,
    pub analyze: String,
    pub reconcile: Vec<ReconcileStatement>,
    /// General correlation query, run after the reconciliation statements
    /// to fill indices they did not report.
    pub correlate: Option<String>,
    pub teardown: String,
}

impl CommandSet {
    /// Number of statements the call will run after streaming.
    pub fn statement_count(&self) -> usize {
        self.reconcile.len() + usize::from(self.correlate.is_some())
    }
}

// ── Identifier helpers ─────────────────────────────────────────────────────

/// Quote a SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Helper: build a comma-separated list of quoted column references.
pub fn col_list(cols: &[String]) -> String {
    cols.iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Helper: build a comma-separated list of prefixed column references.
pub fn prefixed_col_list(prefix: &str, cols: &[String]) -> String {
    cols.iter()
        .map(|c| format!("{prefix}.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A staged column read through `alias`, cast to the destination type
/// when it was staged as something else.
fn staged_expr(alias: &str, m: &FieldMapping) -> String {
    let col = format!("{alias}.{}", quote_ident(&m.column));
    match &m.cast_to {
        Some(ty) => format!("CAST({col} AS {ty})"),
        None => col,
    }
}

// ── Compilation ────────────────────────────────────────────────────────────

/// Compile every statement for `req`.
pub fn compile(req: &BulkRequest) -> Result<CommandSet, BulkError> {
    if let Some(hints) = &req.hints {
        return Err(BulkError::DialectUnsupported(format!(
            "table hints ({hints})"
        )));
    }
    if req.mappings.is_empty() {
        return Err(BulkError::NoFields {
            table: req.destination.to_string(),
        });
    }
    if req.kind.needs_qualifiers() && req.qualifiers.is_empty() {
        return Err(BulkError::NoQualifiers {
            operation: req.kind.to_string(),
            table: req.destination.to_string(),
        });
    }
    let unmapped: Vec<&String> = req
        .qualifiers
        .iter()
        .filter(|q| req.mapping(q).is_none())
        .collect();
    if !unmapped.is_empty() {
        return Err(BulkError::Internal(format!(
            "qualifiers {unmapped:?} are not staged for {}",
            req.destination
        )));
    }

    let sql = Sql::new(req);
    let (reconcile, correlate) = match req.kind {
        OperationKind::Insert => (vec![sql.insert()?], None),
        OperationKind::Merge => match req.merge_strategy {
            MergeStrategy::ConflictClause => (vec![sql.upsert()?], sql.correlation()?),
            MergeStrategy::InsertThenUpdate => {
                let mut stmts = Vec::with_capacity(2);
                if !req.update_columns().is_empty() {
                    stmts.push(sql.update()?);
                }
                stmts.push(sql.insert_missing()?);
                (stmts, sql.correlation()?)
            }
        },
        OperationKind::Update => {
            if req.update_columns().is_empty() {
                return Err(BulkError::NoUpdatableFields {
                    table: req.destination.to_string(),
                });
            }
            (vec![sql.update()?], sql.correlation()?)
        }
        OperationKind::Delete | OperationKind::DeleteByKey => (vec![sql.delete()?], None),
    };

    let mut copy_types = Vec::with_capacity(req.mappings.len() + 1);
    copy_types.push(WireType::Int8);
    copy_types.extend(req.mappings.iter().map(|m| m.wire));

    Ok(CommandSet {
        destination: req.destination.cache_key(),
        staging_ddl: staging::create_statements(&req.staging, &req.order_column, &req.mappings),
        copy_in: staging::copy_statement(&req.staging, &req.order_column, &req.mappings),
        copy_types,
        analyze: staging::analyze_statement(&req.staging),
        reconcile,
        correlate,
        teardown: staging::drop_statement(&req.staging),
    })
}

/// Statement builder over one request.
struct Sql<'a> {
    req: &'a BulkRequest,
    dest: String,
    staging: String,
    order: String,
}

impl<'a> Sql<'a> {
    fn new(req: &'a BulkRequest) -> Self {
        Sql {
            req,
            dest: req.destination.quoted(),
            staging: req.staging.name.quoted(),
            order: quote_ident(&req.order_column),
        }
    }

    fn identity(&self) -> Result<String, BulkError> {
        self.req
            .identity
            .as_ref()
            .map(|i| quote_ident(&i.name))
            .ok_or_else(|| BulkError::IdentityRequired {
                table: self.req.destination.to_string(),
            })
    }

    fn qualifier_mappings(&self) -> Result<Vec<&'a FieldMapping>, BulkError> {
        self.req
            .qualifiers
            .iter()
            .map(|q| {
                self.req.mapping(q).ok_or_else(|| {
                    BulkError::Internal(format!("qualifier {q} is not staged"))
                })
            })
            .collect()
    }

    /// `d.q = <staged s.q>` for every qualifier.
    fn match_condition(&self) -> Result<String, BulkError> {
        Ok(self
            .qualifier_mappings()?
            .iter()
            .map(|m| format!("d.{} = {}", quote_ident(&m.column), staged_expr("s", m)))
            .collect::<Vec<_>>()
            .join(" AND "))
    }

    /// The staged rows with the last occurrence of every qualifier key.
    ///
    /// Rows whose key contains NULL never compare equal and are all kept.
    fn latest_rows(&self) -> Result<String, BulkError> {
        let same_key = self
            .qualifier_mappings()?
            .iter()
            .map(|m| {
                let c = quote_ident(&m.column);
                format!("l.{c} = s.{c}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        Ok(format!(
            "SELECT s.* FROM {staging} AS s WHERE NOT EXISTS \
             (SELECT 1 FROM {staging} AS l WHERE {same_key} AND l.{order} > s.{order})",
            staging = self.staging,
            order = self.order,
        ))
    }

    fn insert_head(&self) -> Result<(String, String), BulkError> {
        let cols = self.req.insert_columns();
        if cols.is_empty() {
            return Err(BulkError::NoFields {
                table: self.req.destination.to_string(),
            });
        }
        let names: Vec<String> = cols.iter().map(|m| m.column.clone()).collect();
        let overriding = match &self.req.identity {
            Some(id)
                if id.generated_always
                    && self.req.writes_identity()
                    && cols.iter().any(|m| m.column.eq_ignore_ascii_case(&id.name)) =>
            {
                " OVERRIDING SYSTEM VALUE"
            }
            _ => "",
        };
        let exprs = cols
            .iter()
            .map(|m| staged_expr("s", m))
            .collect::<Vec<_>>()
            .join(", ");
        Ok((
            format!("INSERT INTO {} ({}){overriding}", self.dest, col_list(&names)),
            exprs,
        ))
    }

    /// Wrap an `INSERT ... SELECT ... FROM <rows> AS s` so the generated
    /// identities are position-matched to the OrderTokens of `rows`.
    ///
    /// Identities are assumed to be assigned in insertion order, which holds
    /// for sequence-backed columns filled by a single ordered INSERT.
    /// Sequences with a negative increment or `CYCLE` break the pairing.
    fn returning_insert(
        &self,
        leading: Option<&str>,
        rows: &str,
        insert: &str,
    ) -> Result<String, BulkError> {
        let id = self.identity()?;
        let leading = leading.map(|cte| format!("{cte}, ")).unwrap_or_default();
        Ok(format!(
            "WITH {leading}__ins AS ({insert} RETURNING {id}), \
             __ranked AS (SELECT {id} AS __identity, ROW_NUMBER() OVER (ORDER BY {id}) AS __pos FROM __ins), \
             __src AS (SELECT s.{order} AS __index, ROW_NUMBER() OVER (ORDER BY s.{order}) AS __pos FROM {rows} AS s) \
             SELECT __src.__index AS \"__index\", __ranked.__identity AS \"__identity\" \
             FROM __src JOIN __ranked ON __ranked.__pos = __src.__pos \
             ORDER BY __src.__index",
            order = self.order,
        ))
    }

    fn insert(&self) -> Result<ReconcileStatement, BulkError> {
        let (head, exprs) = self.insert_head()?;
        let insert = format!(
            "{head} SELECT {exprs} FROM {staging} AS s ORDER BY s.{order}",
            staging = self.staging,
            order = self.order,
        );
        if self.req.returns_identity() {
            Ok(ReconcileStatement {
                kind: StatementKind::Insert,
                sql: self.returning_insert(None, &self.staging, &insert)?,
                yields_identities: true,
            })
        } else {
            Ok(ReconcileStatement {
                kind: StatementKind::Insert,
                sql: insert,
                yields_identities: false,
            })
        }
    }

    /// Insert of the staged rows that match no destination row.
    ///
    /// Rows are de-duplicated on the key first, unless the key is a
    /// generated identity: then every unmatched staged row is a new row.
    fn insert_missing(&self) -> Result<ReconcileStatement, BulkError> {
        let (head, exprs) = self.insert_head()?;
        let rows = if self.req.keyed_on_generated_identity() {
            self.staging.clone()
        } else {
            format!("({})", self.latest_rows()?)
        };
        let pending = format!(
            "SELECT s.* FROM {rows} AS s WHERE NOT EXISTS (SELECT 1 FROM {dest} AS d WHERE {cond})",
            dest = self.dest,
            cond = self.match_condition()?,
        );
        if self.req.returns_identity() {
            let insert = format!(
                "{head} SELECT {exprs} FROM __pending AS s ORDER BY s.{order}",
                order = self.order
            );
            let pending = format!("__pending AS ({pending})");
            Ok(ReconcileStatement {
                kind: StatementKind::Insert,
                sql: self.returning_insert(Some(&pending), "__pending", &insert)?,
                yields_identities: true,
            })
        } else {
            Ok(ReconcileStatement {
                kind: StatementKind::Insert,
                sql: format!(
                    "{head} SELECT {exprs} FROM ({pending}) AS s ORDER BY s.{order}",
                    order = self.order
                ),
                yields_identities: false,
            })
        }
    }

    fn upsert(&self) -> Result<ReconcileStatement, BulkError> {
        let (head, exprs) = self.insert_head()?;
        let targets: Vec<String> = self
            .qualifier_mappings()?
            .iter()
            .map(|m| m.column.clone())
            .collect();
        let updates = self.req.update_columns();
        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let sets = updates
                .iter()
                .map(|m| {
                    let c = quote_ident(&m.column);
                    format!("{c} = EXCLUDED.{c}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {sets}")
        };
        Ok(ReconcileStatement {
            kind: StatementKind::Upsert,
            sql: format!(
                "{head} SELECT {exprs} FROM ({latest}) AS s ORDER BY s.{order} \
                 ON CONFLICT ({targets}) {action}",
                latest = self.latest_rows()?,
                order = self.order,
                targets = col_list(&targets),
            ),
            yields_identities: false,
        })
    }

    fn update(&self) -> Result<ReconcileStatement, BulkError> {
        let sets = self
            .req
            .update_columns()
            .iter()
            .map(|m| format!("{} = {}", quote_ident(&m.column), staged_expr("s", m)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "UPDATE {dest} AS d SET {sets} FROM ({latest}) AS s WHERE {cond}",
            dest = self.dest,
            latest = self.latest_rows()?,
            cond = self.match_condition()?,
        );
        // Only the update half of an insert-then-update merge reports its
        // identities directly; plain updates rely on the correlation query.
        let yields = self.req.returns_identity() && self.req.kind == OperationKind::Merge;
        if yields {
            sql.push_str(&format!(
                " RETURNING s.{order} AS \"__index\", d.{id} AS \"__identity\"",
                order = self.order,
                id = self.identity()?,
            ));
        }
        Ok(ReconcileStatement {
            kind: StatementKind::Update,
            sql,
            yields_identities: yields,
        })
    }

    fn delete(&self) -> Result<ReconcileStatement, BulkError> {
        Ok(ReconcileStatement {
            kind: StatementKind::Delete,
            sql: format!(
                "DELETE FROM {dest} AS d USING {staging} AS s WHERE {cond}",
                dest = self.dest,
                staging = self.staging,
                cond = self.match_condition()?,
            ),
            yields_identities: false,
        })
    }

    /// Staging left-joined to the destination on the qualifiers; the highest
    /// identity per OrderToken wins and unmatched rows are dropped.
    fn correlation(&self) -> Result<Option<String>, BulkError> {
        if !self.req.returns_identity() {
            return Ok(None);
        }
        let id = self.identity()?;
        Ok(Some(format!(
            "SELECT c.__index AS \"__index\", c.__identity AS \"__identity\" FROM (\
             SELECT s.{order} AS __index, d.{id} AS __identity, \
             ROW_NUMBER() OVER (PARTITION BY s.{order} ORDER BY d.{id} DESC NULLS LAST) AS __rank \
             FROM {staging} AS s LEFT JOIN {dest} AS d ON {cond}) AS c \
             WHERE c.__rank = 1 AND c.__identity IS NOT NULL \
             ORDER BY c.__index",
            order = self.order,
            staging = self.staging,
            dest = self.dest,
            cond = self.match_condition()?,
        )))
    }
}
