//! Row sources: where the rows of a bulk call come from.
//!
//! Every source reports its fields once and then yields rows of values in
//! field order. Rows are pulled one at a time, so forward-only cursors can
//! be streamed without buffering.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::BulkError;
use crate::field::Field;
use crate::request::IdentityResult;
use crate::value::{Value, row_fields, row_values};

/// A forward-only stream of rows.
pub trait RowSource {
    /// Field names (and optional declared types), in row value order.
    fn fields(&self) -> Vec<Field>;

    /// The next row, or `None` when exhausted.
    fn next_row(&mut self) -> Result<Option<Vec<Value>>, BulkError>;

    /// Number of remaining rows, when known.
    fn size_hint(&self) -> Option<usize> {
        None
    }
}

// ── Typed entities ─────────────────────────────────────────────────────────

/// An explicit field mapping for a Rust type.
///
/// ```
/// use pg_bulk::{BulkEntity, Field, Value, WireType};
///
/// struct Person {
///     id: Option<i32>,
///     name: String,
/// }
///
/// impl BulkEntity for Person {
///     fn fields() -> Vec<Field> {
///         vec![Field::typed("id", WireType::Int4), Field::new("name")]
///     }
///
///     fn values(&self) -> Vec<Value> {
///         vec![self.id.into(), self.name.as_str().into()]
///     }
///
///     fn set_identity(&mut self, identity: &Value) {
///         if let Value::Int32(id) = identity {
///             self.id = Some(*id);
///         }
///     }
/// }
/// ```
pub trait BulkEntity {
    fn fields() -> Vec<Field>;

    /// Values in [`fields`](BulkEntity::fields) order.
    fn values(&self) -> Vec<Value>;

    /// Receive the identity the server generated for this entity.
    fn set_identity(&mut self, _identity: &Value) {}
}

/// Rows from a slice of entities.
pub struct EntitySource<'a, E> {
    entities: std::slice::Iter<'a, E>,
}

impl<'a, E: BulkEntity> EntitySource<'a, E> {
    pub fn new(entities: &'a [E]) -> Self {
        EntitySource {
            entities: entities.iter(),
        }
    }
}

impl<E: BulkEntity> RowSource for EntitySource<'_, E> {
    fn fields(&self) -> Vec<Field> {
        E::fields()
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, BulkError> {
        Ok(self.entities.next().map(|e| e.values()))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entities.len())
    }
}

/// Write correlated identities back into the entities they came from.
///
/// Returns the number of entities updated. Uncorrelated or out-of-range
/// results are skipped.
pub fn apply_identities<E: BulkEntity>(entities: &mut [E], identities: &[IdentityResult]) -> usize {
    let mut applied = 0;
    for result in identities.iter().filter(|r| r.is_correlated()) {
        if let Some(entity) = usize::try_from(result.index)
            .ok()
            .and_then(|i| entities.get_mut(i))
        {
            entity.set_identity(&result.identity);
            applied += 1;
        }
    }
    applied
}

// ── Field maps ─────────────────────────────────────────────────────────────

/// Rows from name → value maps. The fields are the sorted union of every
/// map's keys; keys missing from a row stream as NULL.
pub struct FieldMapSource<'a> {
    fields: Vec<String>,
    rows: std::slice::Iter<'a, BTreeMap<String, Value>>,
}

impl<'a> FieldMapSource<'a> {
    pub fn new(rows: &'a [BTreeMap<String, Value>]) -> Self {
        let fields: BTreeSet<&String> = rows.iter().flat_map(|r| r.keys()).collect();
        FieldMapSource {
            fields: fields.into_iter().cloned().collect(),
            rows: rows.iter(),
        }
    }
}

impl RowSource for FieldMapSource<'_> {
    fn fields(&self) -> Vec<Field> {
        Field::from_names(&self.fields)
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, BulkError> {
        Ok(self.rows.next().map(|row| {
            self.fields
                .iter()
                .map(|f| row.get(f).cloned().unwrap_or(Value::Null))
                .collect()
        }))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.rows.len())
    }
}

// ── Tabular buffers ────────────────────────────────────────────────────────

/// An in-memory table with a fixed field list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    fields: Vec<Field>,
    rows: Vec<Vec<Value>>,
}

impl DataTable {
    pub fn new(fields: Vec<Field>) -> Self {
        DataTable {
            fields,
            rows: Vec::new(),
        }
    }

    /// Append a row. Its arity must match the field list.
    pub fn push(&mut self, row: Vec<Value>) -> Result<(), BulkError> {
        if row.len() != self.fields.len() {
            return Err(BulkError::InvalidArgument(format!(
                "row has {} values, table has {} fields",
                row.len(),
                self.fields.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn source(&self) -> TableSource<'_> {
        TableSource {
            fields: &self.fields,
            rows: self.rows.iter(),
        }
    }
}

/// Row source over a [`DataTable`].
pub struct TableSource<'a> {
    fields: &'a [Field],
    rows: std::slice::Iter<'a, Vec<Value>>,
}

impl RowSource for TableSource<'_> {
    fn fields(&self) -> Vec<Field> {
        self.fields.to_vec()
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, BulkError> {
        Ok(self.rows.next().cloned())
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.rows.len())
    }
}

// ── Cursors ────────────────────────────────────────────────────────────────

/// Rows pulled from a fallible iterator, e.g. a server-side cursor.
pub struct CursorSource<I> {
    fields: Vec<Field>,
    rows: I,
}

impl<I> CursorSource<I>
where
    I: Iterator<Item = Result<Vec<Value>, BulkError>>,
{
    pub fn new(fields: Vec<Field>, rows: I) -> Self {
        CursorSource { fields, rows }
    }
}

impl<I> RowSource for CursorSource<I>
where
    I: Iterator<Item = Result<Vec<Value>, BulkError>>,
{
    fn fields(&self) -> Vec<Field> {
        self.fields.clone()
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, BulkError> {
        self.rows.next().transpose()
    }
}

/// A cursor over rows read with the `postgres` client. Fields are taken
/// from the first row; an empty result has no fields.
pub fn pg_rows_source(
    rows: &[postgres::Row],
) -> CursorSource<impl Iterator<Item = Result<Vec<Value>, BulkError>> + '_> {
    let fields = rows.first().map(row_fields).unwrap_or_default();
    CursorSource::new(fields, rows.iter().map(row_values))
}

// ── Keys ───────────────────────────────────────────────────────────────────

/// Single-column rows of key values, for delete-by-key.
pub struct KeySource<'a> {
    field: Field,
    keys: std::slice::Iter<'a, Value>,
}

impl<'a> KeySource<'a> {
    pub fn new(field: Field, keys: &'a [Value]) -> Self {
        KeySource {
            field,
            keys: keys.iter(),
        }
    }
}

impl RowSource for KeySource<'_> {
    fn fields(&self) -> Vec<Field> {
        vec![self.field.clone()]
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, BulkError> {
        Ok(self.keys.next().map(|k| vec![k.clone()]))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::WireType;

    #[derive(Debug, Default)]
    struct Person {
        id: Option<i64>,
        name: String,
    }

    impl BulkEntity for Person {
        fn fields() -> Vec<Field> {
            vec![Field::typed("id", WireType::Int8), Field::new("name")]
        }

        fn values(&self) -> Vec<Value> {
            vec![self.id.into(), self.name.as_str().into()]
        }

        fn set_identity(&mut self, identity: &Value) {
            self.id = identity.as_i64();
        }
    }

    fn drain(source: &mut dyn RowSource) -> Vec<Vec<Value>> {
        let mut rows = Vec::new();
        while let Some(row) = source.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_entity_source() {
        let people = vec![
            Person {
                id: None,
                name: "a".into(),
            },
            Person {
                id: Some(7),
                name: "b".into(),
            },
        ];
        let mut source = EntitySource::new(&people);
        assert_eq!(source.fields().len(), 2);
        assert_eq!(source.size_hint(), Some(2));
        let rows = drain(&mut source);
        assert_eq!(rows[0], vec![Value::Null, Value::Text("a".into())]);
        assert_eq!(rows[1], vec![Value::Int64(7), Value::Text("b".into())]);
    }

    #[test]
    fn test_apply_identities() {
        let mut people: Vec<Person> = (0..3).map(|_| Person::default()).collect();
        let results = vec![
            IdentityResult::new(0, Value::Int64(10)),
            IdentityResult::new(2, Value::Int64(12)),
            IdentityResult::new(5, Value::Int64(15)),
            IdentityResult::uncorrelated(Value::Int64(99)),
        ];
        assert_eq!(apply_identities(&mut people, &results), 2);
        assert_eq!(people[0].id, Some(10));
        assert_eq!(people[1].id, None);
        assert_eq!(people[2].id, Some(12));
    }

    #[test]
    fn test_field_map_source_union_of_keys() {
        let mut a = BTreeMap::new();
        a.insert("name".to_string(), Value::from("x"));
        let mut b = BTreeMap::new();
        b.insert("age".to_string(), Value::Int32(3));
        b.insert("name".to_string(), Value::from("y"));
        let rows = vec![a, b];

        let mut source = FieldMapSource::new(&rows);
        let names: Vec<String> = source.fields().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["age", "name"]);
        let rows = drain(&mut source);
        assert_eq!(rows[0], vec![Value::Null, Value::Text("x".into())]);
        assert_eq!(rows[1], vec![Value::Int32(3), Value::Text("y".into())]);
    }

    #[test]
    fn test_data_table_arity_check() {
        let mut t = DataTable::new(Field::from_names(&["a", "b"]));
        assert!(t.push(vec![Value::Int32(1)]).is_err());
        t.push(vec![Value::Int32(1), Value::Null]).unwrap();
        assert_eq!(t.len(), 1);
        assert!(!t.is_empty());
        let mut source = t.source();
        assert_eq!(source.size_hint(), Some(1));
        assert_eq!(drain(&mut source).len(), 1);
        assert_eq!(source.size_hint(), Some(0));
    }

    #[test]
    fn test_cursor_source_propagates_errors() {
        let rows = vec![
            Ok(vec![Value::Int32(1)]),
            Err(BulkError::Connection("lost".into())),
        ];
        let mut source = CursorSource::new(Field::from_names(&["a"]), rows.into_iter());
        assert_eq!(source.next_row().unwrap(), Some(vec![Value::Int32(1)]));
        assert!(source.next_row().is_err());
    }

    #[test]
    fn test_key_source() {
        let keys = vec![Value::Int32(1), Value::Int32(2)];
        let mut source = KeySource::new(Field::new("id"), &keys);
        assert_eq!(source.fields(), vec![Field::new("id")]);
        assert_eq!(drain(&mut source), vec![vec![Value::Int32(1)], vec![Value::Int32(2)]]);
    }
}
