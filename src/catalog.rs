//! Catalog layer: destination table snapshots read from `pg_catalog`.
//!
//! One query returns every live column of the destination in attribute
//! order, with its formatted type, base type, primary key membership and
//! identity/generation flags. [`build_schema`] turns the raw rows into a
//! [`TableSchema`] so the classification can be tested without a server.

use crate::error::BulkError;
use crate::field::{DbColumn, QualifiedName, TableSchema};

/// Column metadata of the relation named by `$1` (a quoted, possibly
/// schema-qualified name). Returns no rows when the relation does not exist.
pub const SCHEMA_QUERY: &str = "\
SELECT a.attname::text AS name, \
       format_type(a.atttypid, a.atttypmod) AS type_name, \
       COALESCE(bt.typname, t.typname)::text AS base_type, \
       COALESCE(pk.indisprimary, false) AS is_primary, \
       a.attidentity::text AS attidentity, \
       COALESCE(pg_get_expr(ad.adbin, ad.adrelid) LIKE 'nextval(%', false) AS is_serial, \
       a.attgenerated::text AS attgenerated \
FROM pg_attribute a \
JOIN pg_type t ON t.oid = a.atttypid \
LEFT JOIN pg_type bt ON t.typtype = 'd' AND bt.oid = t.typbasetype \
LEFT JOIN pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum \
LEFT JOIN pg_index pk ON pk.indrelid = a.attrelid AND pk.indisprimary AND a.attnum = ANY(pk.indkey) \
WHERE a.attrelid = to_regclass($1::text) AND a.attnum > 0 AND NOT a.attisdropped \
ORDER BY a.attnum";

/// One row of [`SCHEMA_QUERY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogColumn {
    pub name: String,
    pub type_name: String,
    pub base_type: String,
    pub is_primary: bool,
    /// `pg_attribute.attidentity`: `a` (always), `d` (by default) or empty.
    pub attidentity: String,
    pub is_serial: bool,
    /// `pg_attribute.attgenerated`: `s` for stored generated columns.
    pub attgenerated: String,
}

impl CatalogColumn {
    pub fn from_row(row: &postgres::Row) -> Result<Self, BulkError> {
        let read = |e: postgres::Error| BulkError::Connection(format!("catalog row: {e}"));
        Ok(CatalogColumn {
            name: row.try_get("name").map_err(read)?,
            type_name: row.try_get("type_name").map_err(read)?,
            base_type: row.try_get("base_type").map_err(read)?,
            is_primary: row.try_get("is_primary").map_err(read)?,
            attidentity: row
                .try_get::<_, Option<String>>("attidentity")
                .map_err(read)?
                .unwrap_or_default(),
            is_serial: row.try_get("is_serial").map_err(read)?,
            attgenerated: row
                .try_get::<_, Option<String>>("attgenerated")
                .map_err(read)?
                .unwrap_or_default(),
        })
    }

    fn into_column(self) -> DbColumn {
        let identity_kind = self.attidentity.trim();
        DbColumn {
            is_identity: !identity_kind.is_empty() || self.is_serial,
            generated_always: identity_kind == "a",
            is_generated: !self.attgenerated.trim().is_empty(),
            is_primary: self.is_primary,
            name: self.name,
            type_name: self.type_name,
            base_type: self.base_type,
        }
    }
}

/// Build a snapshot from catalog rows. `None` when the table has no rows,
/// i.e. it does not exist.
pub fn build_schema(
    table: &QualifiedName,
    rows: Vec<CatalogColumn>,
) -> Result<Option<TableSchema>, BulkError> {
    if rows.is_empty() {
        return Ok(None);
    }
    let columns = rows.into_iter().map(CatalogColumn::into_column).collect();
    TableSchema::new(table.clone(), columns).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, type_name: &str) -> CatalogColumn {
        CatalogColumn {
            name: name.into(),
            type_name: type_name.into(),
            base_type: type_name.into(),
            is_primary: false,
            attidentity: String::new(),
            is_serial: false,
            attgenerated: String::new(),
        }
    }

    #[test]
    fn test_missing_table_has_no_schema() {
        let table = QualifiedName::new(None, "nope");
        assert!(build_schema(&table, vec![]).unwrap().is_none());
    }

    #[test]
    fn test_identity_classification() {
        let table = QualifiedName::new(Some("public"), "person");
        let rows = vec![
            CatalogColumn {
                is_primary: true,
                attidentity: "a".into(),
                ..column("id", "integer")
            },
            column("name", "text"),
            CatalogColumn {
                attgenerated: "s".into(),
                ..column("name_upper", "text")
            },
        ];
        let schema = build_schema(&table, rows).unwrap().unwrap();
        let id = schema.identity().unwrap();
        assert_eq!(id.name, "id");
        assert!(id.generated_always);
        assert!(id.is_primary);
        assert!(schema.column("name_upper").unwrap().is_generated);
        assert!(!schema.column("name").unwrap().is_identity);
    }

    #[test]
    fn test_serial_is_identity_by_default() {
        let table = QualifiedName::new(None, "t");
        let rows = vec![CatalogColumn {
            is_serial: true,
            ..column("id", "bigint")
        }];
        let schema = build_schema(&table, rows).unwrap().unwrap();
        let id = schema.identity().unwrap();
        assert!(id.is_identity);
        assert!(!id.generated_always);
    }

    #[test]
    fn test_schema_query_shape() {
        assert!(SCHEMA_QUERY.contains("to_regclass($1::text)"));
        assert!(SCHEMA_QUERY.contains("NOT a.attisdropped"));
        assert!(SCHEMA_QUERY.ends_with("ORDER BY a.attnum"));
    }
}
