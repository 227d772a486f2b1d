//! Column/value fragment derivation for INSERT and UPDATE statements.

use super::{join, raw, Arg, SqlFragment, SqlValue};
use crate::error::{PgError, Result};

/// An ordered column name → value mapping from which INSERT column lists,
/// VALUES lists and UPDATE SET clauses are derived.
#[derive(Debug, Clone)]
pub struct InsertFragment {
    entries: Vec<(String, SqlValue)>,
}

impl InsertFragment {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SqlValue>,
    {
        InsertFragment {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Comma-joined raw column names, in insertion order.
    pub fn columns(&self) -> Result<SqlFragment> {
        join(self.entries.iter().map(|(name, _)| raw(name)))
    }

    /// Comma-joined bound values, in the same column order.
    pub fn values(&self) -> Result<SqlFragment> {
        join(self.entries.iter().map(|(_, value)| value.clone()))
    }

    /// `col = $n` assignment pairs for a subset of columns, deduplicated in
    /// first-seen order. Unknown column names are rejected.
    pub fn set(&self, columns: &[&str]) -> Result<SqlFragment> {
        let mut seen: Vec<&str> = Vec::with_capacity(columns.len());
        for column in columns {
            if !seen.contains(column) {
                seen.push(column);
            }
        }

        let mut pairs = Vec::with_capacity(seen.len());
        for column in seen {
            let value = self
                .entries
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| PgError::UnknownColumn(column.to_string()))?;

            pairs.push(crate::sql!({raw(column)} " = " {value}));
        }

        join(pairs.into_iter().map(Arg::from))
    }
}

/// Derive insert fragments from an ordered record.
pub fn make_insert_fragment<I, K, V>(record: I) -> InsertFragment
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<SqlValue>,
{
    InsertFragment::new(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql;

    fn customer() -> InsertFragment {
        make_insert_fragment(vec![
            ("first_name", SqlValue::from("John")),
            ("last_name", SqlValue::from("Doe")),
            ("email", SqlValue::from("john@example.com")),
            ("age", SqlValue::from(30)),
        ])
    }

    #[test]
    fn test_insert_columns_and_values() {
        let record = customer();
        let columns = record.columns().unwrap();
        let values = record.values().unwrap();

        let query = sql!("INSERT INTO customers (" {columns} ") VALUES (" {values} ") RETURNING " {"id"});

        assert_eq!(
            query.text(),
            "INSERT INTO customers (first_name, last_name, email, age) \
             VALUES ($1, $2, $3, $4) RETURNING $5"
        );
        assert_eq!(
            query.values(),
            &[
                SqlValue::Text("John".to_string()),
                SqlValue::Text("Doe".to_string()),
                SqlValue::Text("john@example.com".to_string()),
                SqlValue::I32(30),
                SqlValue::Text("id".to_string()),
            ]
        );
    }

    #[test]
    fn test_set_deduplicates_preserving_order() {
        let record = customer();
        let set = record.set(&["email", "age", "email"]).unwrap();

        assert_eq!(set.text(), "email = $1, age = $2");
        assert_eq!(
            set.values(),
            &[SqlValue::Text("john@example.com".to_string()), SqlValue::I32(30)]
        );
    }

    #[test]
    fn test_set_unknown_column() {
        let record = customer();
        let err = record.set(&["nope"]).unwrap_err();

        assert!(matches!(err, PgError::UnknownColumn(name) if name == "nope"));
    }

    #[test]
    fn test_empty_record_fails_join() {
        let record = InsertFragment::new(Vec::<(String, SqlValue)>::new());

        assert!(matches!(record.columns().unwrap_err(), PgError::EmptyJoin));
        assert!(matches!(record.values().unwrap_err(), PgError::EmptyJoin));
    }
}
