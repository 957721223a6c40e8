//! Qualifier resolution: which columns identify a row for merge,
//! update and delete.
//!
//! Explicit qualifiers are used verbatim; otherwise the primary key is the
//! match key. Every qualifier must be part of the written field list,
//! since the match runs against staged values.

use crate::error::BulkError;
use crate::field::FieldMapping;

/// Reject an explicitly empty qualifier list before anything is executed.
pub fn precheck(table: &str, explicit: Option<&[String]>) -> Result<(), BulkError> {
    match explicit {
        Some(list) if list.iter().all(|q| q.trim().is_empty()) => {
            Err(BulkError::MissingQualifier {
                table: table.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Resolve the ordered qualifier columns.
///
/// Returns destination column names in their catalog spelling.
pub fn resolve(
    table: &str,
    explicit: Option<&[String]>,
    primary_keys: &[String],
    written: &[FieldMapping],
) -> Result<Vec<String>, BulkError> {
    precheck(table, explicit)?;

    let requested: Vec<&str> = match explicit {
        Some(list) => list.iter().map(String::as_str).collect(),
        None if !primary_keys.is_empty() => primary_keys.iter().map(String::as_str).collect(),
        None => {
            return Err(BulkError::MissingQualifier {
                table: table.to_string(),
            });
        }
    };

    let mut resolved: Vec<String> = Vec::with_capacity(requested.len());
    let mut missing: Vec<String> = Vec::new();
    for name in requested {
        let found = written
            .iter()
            .find(|m| m.column.eq_ignore_ascii_case(name) || m.source.eq_ignore_ascii_case(name));
        match found {
            Some(m) => {
                if !resolved.iter().any(|r| r.eq_ignore_ascii_case(&m.column)) {
                    resolved.push(m.column.clone());
                }
            }
            None => missing.push(name.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(BulkError::QualifierNotInFields {
            table: table.to_string(),
            missing,
        });
    }
    Ok(resolved)
}
