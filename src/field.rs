//! Fields, columns and the mapping between them.
//!
//! A [`Field`] is what the caller's rows carry; a [`DbColumn`] is what the
//! destination table declares. [`FieldMapping`]s join the two and fix the
//! column order of both the staging relation and the binary stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BulkError;

// ── Wire types ─────────────────────────────────────────────────────────────

/// PostgreSQL types the binary writer can encode natively.
///
/// Columns of any other type are staged as [`WireType::Text`] and cast to
/// the destination type inside the reconciliation statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Varchar,
    Bpchar,
    Bytea,
    Uuid,
    Json,
    Jsonb,
    Date,
    Timestamp,
    TimestampTz,
}

impl WireType {
    /// Resolve a base type name (`pg_type.typname`). Returns `None` for
    /// types without a native encoder.
    pub fn from_type_name(name: &str) -> Option<Self> {
        let wire = match name.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => WireType::Bool,
            "int2" | "smallint" => WireType::Int2,
            "int4" | "int" | "integer" => WireType::Int4,
            "int8" | "bigint" => WireType::Int8,
            "float4" | "real" => WireType::Float4,
            "float8" | "double precision" => WireType::Float8,
            "text" | "name" => WireType::Text,
            "varchar" | "character varying" => WireType::Varchar,
            "bpchar" | "character" => WireType::Bpchar,
            "bytea" => WireType::Bytea,
            "uuid" => WireType::Uuid,
            "json" => WireType::Json,
            "jsonb" => WireType::Jsonb,
            "date" => WireType::Date,
            "timestamp" | "timestamp without time zone" => WireType::Timestamp,
            "timestamptz" | "timestamp with time zone" => WireType::TimestampTz,
            _ => return None,
        };
        Some(wire)
    }

    /// SQL type used for a staging column when no destination type is known.
    pub fn sql_name(&self) -> &'static str {
        match self {
            WireType::Bool => "boolean",
            WireType::Int2 => "smallint",
            WireType::Int4 => "integer",
            WireType::Int8 => "bigint",
            WireType::Float4 => "real",
            WireType::Float8 => "double precision",
            WireType::Text => "text",
            WireType::Varchar => "character varying",
            WireType::Bpchar => "character",
            WireType::Bytea => "bytea",
            WireType::Uuid => "uuid",
            WireType::Json => "json",
            WireType::Jsonb => "jsonb",
            WireType::Date => "date",
            WireType::Timestamp => "timestamp without time zone",
            WireType::TimestampTz => "timestamp with time zone",
        }
    }

    /// The matching `postgres` type for the binary COPY header check.
    pub fn pg_type(&self) -> postgres::types::Type {
        use postgres::types::Type;
        match self {
            WireType::Bool => Type::BOOL,
            WireType::Int2 => Type::INT2,
            WireType::Int4 => Type::INT4,
            WireType::Int8 => Type::INT8,
            WireType::Float4 => Type::FLOAT4,
            WireType::Float8 => Type::FLOAT8,
            WireType::Text => Type::TEXT,
            WireType::Varchar => Type::VARCHAR,
            WireType::Bpchar => Type::BPCHAR,
            WireType::Bytea => Type::BYTEA,
            WireType::Uuid => Type::UUID,
            WireType::Json => Type::JSON,
            WireType::Jsonb => Type::JSONB,
            WireType::Date => Type::DATE,
            WireType::Timestamp => Type::TIMESTAMP,
            WireType::TimestampTz => Type::TIMESTAMPTZ,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, WireType::Int2 | WireType::Int4 | WireType::Int8)
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, WireType::Text | WireType::Varchar | WireType::Bpchar)
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WireType::Bool => "bool",
            WireType::Int2 => "int2",
            WireType::Int4 => "int4",
            WireType::Int8 => "int8",
            WireType::Float4 => "float4",
            WireType::Float8 => "float8",
            WireType::Text => "text",
            WireType::Varchar => "varchar",
            WireType::Bpchar => "bpchar",
            WireType::Bytea => "bytea",
            WireType::Uuid => "uuid",
            WireType::Json => "json",
            WireType::Jsonb => "jsonb",
            WireType::Date => "date",
            WireType::Timestamp => "timestamp",
            WireType::TimestampTz => "timestamptz",
        };
        write!(f, "{name}")
    }
}

// ── Field ──────────────────────────────────────────────────────────────────

/// A named field carried by the caller's rows.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    declared: Option<WireType>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Field {
            name: name.into(),
            declared: None,
        }
    }

    pub fn typed(name: impl Into<String>, declared: WireType) -> Self {
        Field {
            name: name.into(),
            declared: Some(declared),
        }
    }

    /// Build an untyped field list from names.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Vec<Field> {
        names.iter().map(|n| Field::new(n.as_ref())).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared(&self) -> Option<WireType> {
        self.declared
    }

    /// Case-insensitive name comparison, ignoring declared types.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        if !self.name.eq_ignore_ascii_case(&other.name) {
            return false;
        }
        match (self.declared, other.declared) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ── Destination schema ─────────────────────────────────────────────────────

/// A column of the destination table, as read from `pg_catalog`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbColumn {
    pub name: String,
    /// Formatted SQL type, e.g. `character varying(100)`.
    pub type_name: String,
    /// Base type name (`pg_type.typname`), e.g. `varchar`.
    pub base_type: String,
    pub is_primary: bool,
    /// Serial default or `GENERATED ... AS IDENTITY`.
    pub is_identity: bool,
    /// `GENERATED ALWAYS AS IDENTITY`; inserts need `OVERRIDING SYSTEM VALUE`.
    pub generated_always: bool,
    /// `GENERATED ALWAYS AS (...) STORED`; never written.
    pub is_generated: bool,
}

impl DbColumn {
    pub fn new(name: &str, type_name: &str) -> Self {
        DbColumn {
            name: name.to_string(),
            type_name: type_name.to_string(),
            base_type: type_name.to_string(),
            is_primary: false,
            is_identity: false,
            generated_always: false,
            is_generated: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self
    }

    pub fn wire_type(&self) -> Option<WireType> {
        WireType::from_type_name(&self.base_type)
    }
}

/// Ordered snapshot of a destination table's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: QualifiedName,
    pub columns: Vec<DbColumn>,
}

impl TableSchema {
    /// Build a snapshot, rejecting tables with more than one identity column.
    pub fn new(table: QualifiedName, columns: Vec<DbColumn>) -> Result<Self, BulkError> {
        let identities = columns.iter().filter(|c| c.is_identity).count();
        if identities > 1 {
            return Err(BulkError::Internal(format!(
                "table {table} reports {identities} identity columns"
            )));
        }
        Ok(TableSchema { table, columns })
    }

    pub fn column(&self, name: &str) -> Option<&DbColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_keys(&self) -> Vec<&DbColumn> {
        self.columns.iter().filter(|c| c.is_primary).collect()
    }

    pub fn identity(&self) -> Option<&DbColumn> {
        self.columns.iter().find(|c| c.is_identity)
    }
}

// ── Qualified relation names ───────────────────────────────────────────────

/// A possibly schema-qualified relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        QualifiedName {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Parse `table`, `schema.table` or their double-quoted forms.
    ///
    /// Unquoted parts are folded to lower case the way PostgreSQL folds
    /// unquoted identifiers.
    pub fn parse(input: &str) -> Result<Self, BulkError> {
        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        let mut was_quoted = false;
        let mut chars = input.trim().chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '"' if quoted => {
                    if chars.peek() == Some(&'"') {
                        current.push('"');
                        chars.next();
                    } else {
                        quoted = false;
                    }
                }
                '"' => {
                    quoted = true;
                    was_quoted = true;
                }
                '.' if !quoted => {
                    parts.push(finish_part(&mut current, was_quoted));
                    was_quoted = false;
                }
                _ => current.push(c),
            }
        }
        if quoted {
            return Err(BulkError::InvalidArgument(format!(
                "unterminated quoted identifier in {input:?}"
            )));
        }
        parts.push(finish_part(&mut current, was_quoted));

        if parts.iter().any(|p| p.is_empty()) {
            return Err(BulkError::InvalidArgument(format!(
                "invalid relation name {input:?}"
            )));
        }
        match parts.len() {
            1 => Ok(QualifiedName {
                schema: None,
                name: parts.remove(0),
            }),
            2 => {
                let name = parts.remove(1);
                Ok(QualifiedName {
                    schema: Some(parts.remove(0)),
                    name,
                })
            }
            _ => Err(BulkError::InvalidArgument(format!(
                "relation name {input:?} has too many parts"
            ))),
        }
    }

    /// The quoted SQL form, e.g. `"public"."person"`.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!(
                "{}.{}",
                crate::compiler::quote_ident(schema),
                crate::compiler::quote_ident(&self.name)
            ),
            None => crate::compiler::quote_ident(&self.name),
        }
    }

    /// A lower-cased lookup key.
    pub fn cache_key(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name).to_lowercase(),
            None => self.name.to_lowercase(),
        }
    }
}

fn finish_part(current: &mut String, was_quoted: bool) -> String {
    let part = std::mem::take(current);
    if was_quoted {
        part
    } else {
        part.trim().to_lowercase()
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// ── Field mapping ──────────────────────────────────────────────────────────

/// One staged column: where its value comes from and how it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    /// Field name as the source reported it.
    pub source: String,
    /// Position of the value in each source row.
    pub source_index: usize,
    /// Destination column name (catalog spelling).
    pub column: String,
    pub wire: WireType,
    /// Column type in the staging relation.
    pub staged_type: String,
    /// Destination type to cast to when the staged type differs.
    pub cast_to: Option<String>,
}

impl FieldMapping {
    /// Map a source field onto a destination column.
    pub fn new(field: &Field, source_index: usize, column: &DbColumn) -> Self {
        match column.wire_type() {
            Some(wire) => FieldMapping {
                source: field.name().to_string(),
                source_index,
                column: column.name.clone(),
                wire,
                staged_type: column.type_name.clone(),
                cast_to: None,
            },
            None => {
                let wire = field.declared().unwrap_or(WireType::Text);
                FieldMapping {
                    source: field.name().to_string(),
                    source_index,
                    column: column.name.clone(),
                    wire,
                    staged_type: wire.sql_name().to_string(),
                    cast_to: Some(column.type_name.clone()),
                }
            }
        }
    }

    /// Map a source field that has no destination column snapshot.
    pub fn inferred(field: &Field, source_index: usize) -> Self {
        let wire = field.declared().unwrap_or(WireType::Text);
        FieldMapping {
            source: field.name().to_string(),
            source_index,
            column: field.name().to_string(),
            wire,
            staged_type: wire.sql_name().to_string(),
            cast_to: None,
        }
    }
}
