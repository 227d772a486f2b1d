//! Composable parameterized SQL statements.
//!
//! A [`SqlFragment`] is an ordered list of literal segments with bound values
//! between them. Interpolating another fragment splices its segments and
//! values into the parent, and positional placeholders are renumbered so the
//! final text is exactly what a human would write by inlining the nested
//! statement by hand. Values stay in left-to-right encounter order, including
//! values buried inside nested fragments.
//!
//! The [`sql!`](crate::sql!) macro is the usual entry point:
//!
//! ```
//! use pgkit::sql;
//!
//! let min_age = 21;
//! let adults = sql!("SELECT id FROM users WHERE age >= " {min_age});
//! let query = sql!("SELECT count(*) FROM (" {adults} ") AS q");
//!
//! assert_eq!(query.text(), "SELECT count(*) FROM (SELECT id FROM users WHERE age >= $1) AS q");
//! ```

mod insert;
mod value;

pub use insert::{make_insert_fragment, InsertFragment};
pub use value::SqlValue;

use crate::error::{PgError, Result};
use std::fmt;
use tokio_postgres::types::ToSql;

/// Anything that can be interpolated into a statement: a plain bound value
/// or a nested fragment to splice.
#[derive(Debug, Clone)]
pub enum Arg {
    Value(SqlValue),
    Fragment(SqlFragment),
}

impl From<SqlValue> for Arg {
    fn from(value: SqlValue) -> Self {
        Arg::Value(value)
    }
}

impl From<SqlFragment> for Arg {
    fn from(fragment: SqlFragment) -> Self {
        Arg::Fragment(fragment)
    }
}

impl From<&SqlFragment> for Arg {
    fn from(fragment: &SqlFragment) -> Self {
        Arg::Fragment(fragment.clone())
    }
}

macro_rules! impl_arg_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Value(SqlValue::from(value))
                }
            }
        )*
    };
}

impl_arg_from!(
    bool,
    i16,
    i32,
    i64,
    f32,
    f64,
    &str,
    String,
    &String,
    Vec<u8>,
    uuid::Uuid,
    rust_decimal::Decimal,
    chrono::DateTime<chrono::Utc>,
    chrono::NaiveDate,
    chrono::NaiveTime,
    serde_json::Value,
    Vec<String>,
    Vec<i32>,
    Vec<i64>,
);

impl<T: Into<SqlValue>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        Arg::Value(SqlValue::from(value))
    }
}

/// An immutable parameterized statement: final text with `$1..$n`
/// placeholders plus the bound values in placeholder order.
///
/// Invariant: `segments.len() == values.len() + 1`, so placeholders are
/// contiguous from `$1` by construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    segments: Vec<String>,
    values: Vec<SqlValue>,
    text: String,
}

impl SqlFragment {
    /// Build a fragment from literal segments with one arg between each pair
    /// of adjacent segments. Nested fragments are spliced in place; missing
    /// trailing segments are treated as empty.
    pub fn new<S, A>(segments: Vec<S>, args: Vec<A>) -> Self
    where
        S: Into<String>,
        A: Into<Arg>,
    {
        let mut seg_iter = segments.into_iter().map(Into::into);
        let mut out_segments: Vec<String> = vec![seg_iter.next().unwrap_or_default()];
        let mut out_values: Vec<SqlValue> = Vec::new();

        for arg in args {
            let next = seg_iter.next().unwrap_or_default();
            match arg.into() {
                Arg::Value(value) => {
                    out_values.push(value);
                    out_segments.push(next);
                }
                Arg::Fragment(child) => {
                    let mut child_segments = child.segments.into_iter();
                    let first = child_segments.next().unwrap_or_default();
                    if let Some(tail) = out_segments.last_mut() {
                        tail.push_str(&first);
                    }
                    for value in child.values {
                        out_values.push(value);
                        out_segments.push(child_segments.next().unwrap_or_default());
                    }
                    if let Some(tail) = out_segments.last_mut() {
                        tail.push_str(&next);
                    }
                }
            }
        }

        let text = render(&out_segments);
        SqlFragment {
            segments: out_segments,
            values: out_values,
            text,
        }
    }

    /// Wrap literal text with zero bound values. No escaping is performed;
    /// intended for identifiers and keywords, never for untrusted data.
    pub fn raw(text: impl Into<String>) -> Self {
        SqlFragment::new::<String, Arg>(vec![text.into()], Vec::new())
    }

    /// The final statement text with contiguous `$1..$n` placeholders,
    /// common-indentation stripped.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Bound values in placeholder order.
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Borrow the values in the shape the driver expects.
    pub fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect()
    }
}

impl fmt::Display for SqlFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Incremental builder behind the [`sql!`](crate::sql!) macro. Also usable
/// directly when a statement is assembled across control flow.
#[derive(Debug, Default)]
pub struct SqlBuilder {
    segments: Vec<String>,
    args: Vec<Arg>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        SqlBuilder {
            segments: vec![String::new()],
            args: Vec::new(),
        }
    }

    /// Append literal text to the current segment.
    pub fn text(&mut self, literal: &str) -> &mut Self {
        if let Some(tail) = self.segments.last_mut() {
            tail.push_str(literal);
        }
        self
    }

    /// Append an interpolated value or nested fragment.
    pub fn arg(&mut self, arg: impl Into<Arg>) -> &mut Self {
        self.args.push(arg.into());
        self.segments.push(String::new());
        self
    }

    pub fn finish(self) -> SqlFragment {
        SqlFragment::new(self.segments, self.args)
    }
}

/// Shorthand for [`SqlFragment::raw`].
pub fn raw(text: impl Into<String>) -> SqlFragment {
    SqlFragment::raw(text)
}

/// The empty fragment. Useful as an optional clause placeholder.
pub fn empty() -> SqlFragment {
    SqlFragment::raw("")
}

/// Join fragments or values with `", "`.
pub fn join<I>(args: I) -> Result<SqlFragment>
where
    I: IntoIterator,
    I::Item: Into<Arg>,
{
    join_with(args, ", ", "", "")
}

/// Build `prefix + a1 + separator + a2 + ... + suffix`. Each arg may be a
/// raw fragment, a bound value or a nested statement.
pub fn join_with<I>(args: I, separator: &str, prefix: &str, suffix: &str) -> Result<SqlFragment>
where
    I: IntoIterator,
    I::Item: Into<Arg>,
{
    let args: Vec<Arg> = args.into_iter().map(Into::into).collect();
    if args.is_empty() {
        return Err(PgError::EmptyJoin);
    }

    let mut segments = Vec::with_capacity(args.len() + 1);
    segments.push(prefix.to_string());
    for _ in 1..args.len() {
        segments.push(separator.to_string());
    }
    segments.push(suffix.to_string());

    Ok(SqlFragment::new(segments, args))
}

/// Build a [`SqlFragment`] from alternating string literals and `{expr}`
/// interpolations. A fragment expression splices, anything else binds:
///
/// ```
/// use pgkit::{sql, sql::raw};
///
/// let table = raw("users");
/// let q = sql!("SELECT * FROM " {table} " WHERE id = " {7} " AND active = " {true});
/// assert_eq!(q.text(), "SELECT * FROM users WHERE id = $1 AND active = $2");
/// ```
#[macro_export]
macro_rules! sql {
    ($($tt:tt)*) => {{
        let mut builder = $crate::sql::SqlBuilder::new();
        $crate::__sql_push!(builder $($tt)*);
        builder.finish()
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __sql_push {
    ($builder:ident) => {};
    ($builder:ident $literal:literal $($rest:tt)*) => {
        $builder.text($literal);
        $crate::__sql_push!($builder $($rest)*);
    };
    ($builder:ident {$arg:expr} $($rest:tt)*) => {
        $builder.arg($arg);
        $crate::__sql_push!($builder $($rest)*);
    };
}

fn render(segments: &[String]) -> String {
    let mut text = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            text.push('$');
            text.push_str(&i.to_string());
        }
        text.push_str(segment);
    }
    dedent(&text)
}

/// Strip the common leading indentation of non-blank lines and trim outer
/// whitespace, so multi-line embedded statements compare and log cleanly.
fn dedent(input: &str) -> String {
    let indent = input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(leading_whitespace)
        .min()
        .unwrap_or(0);

    let stripped: Vec<&str> = input
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                &line[indent..]
            }
        })
        .collect();

    stripped.join("\n").trim().to_string()
}

fn leading_whitespace(line: &str) -> usize {
    line.bytes()
        .take_while(|b| *b == b' ' || *b == b'\t')
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_query() {
        let query = sql!("SELECT * FROM users");

        assert_eq!(query.text(), "SELECT * FROM users");
        assert!(query.values().is_empty());
    }

    #[test]
    fn test_one_param() {
        let query = sql!("SELECT * FROM users WHERE id = " {1});

        assert_eq!(query.text(), "SELECT * FROM users WHERE id = $1");
        assert_eq!(query.values(), &[SqlValue::I32(1)]);
    }

    #[test]
    fn test_two_params() {
        let query = sql!("SELECT * FROM users WHERE id = " {1} " AND name ilike " {"acme"});

        assert_eq!(
            query.text(),
            "SELECT * FROM users WHERE id = $1 AND name ilike $2"
        );
        assert_eq!(
            query.values(),
            &[SqlValue::I32(1), SqlValue::Text("acme".to_string())]
        );
    }

    #[test]
    fn test_child_fragment_without_values() {
        let table = sql!("users");
        let query = sql!("SELECT * FROM " {table});

        assert_eq!(query.text(), "SELECT * FROM users");
        assert!(query.values().is_empty());
    }

    #[test]
    fn test_raw_fragment() {
        let table = raw("users");
        let query = sql!("SELECT * FROM " {table});

        assert_eq!(query.text(), "SELECT * FROM users");
        assert!(query.values().is_empty());
    }

    #[test]
    fn test_composition_ordering() {
        let inner = sql!("b" {"value_b"});
        let outer = sql!("a" {inner} "c" {42});

        assert_eq!(outer.text(), "ab$1c$2");
        assert_eq!(
            outer.values(),
            &[SqlValue::Text("value_b".to_string()), SqlValue::I32(42)]
        );
    }

    #[test]
    fn test_many_inner_fragments() {
        let q1 = sql!("SELECT * FROM users WHERE name ilike " {"acme"});
        let q2 = sql!("SELECT * FROM roles WHERE role_group = ANY(" {vec!["a".to_string(), "b".to_string()]} ")");
        let field = raw("name");

        let query = sql!(r#"
            SELECT u."# {field} r#", r.name
            FROM ("# {q1} r#") AS u
            INNER JOIN ("# {q2} r#") AS r ON u.role_id = r.id
        "#);

        assert_eq!(
            query.text(),
            "SELECT u.name, r.name\n\
             FROM (SELECT * FROM users WHERE name ilike $1) AS u\n\
             INNER JOIN (SELECT * FROM roles WHERE role_group = ANY($2)) AS r ON u.role_id = r.id"
        );
        assert_eq!(
            query.values(),
            &[
                SqlValue::Text("acme".to_string()),
                SqlValue::TextArray(vec!["a".to_string(), "b".to_string()]),
            ]
        );
    }

    #[test]
    fn test_placeholders_renumbered_after_splice() {
        let clause = sql!("age >= " {21} " AND age < " {65});
        let query = sql!("SELECT * FROM users WHERE id = " {7} " AND " {clause} " AND active = " {true});

        assert_eq!(
            query.text(),
            "SELECT * FROM users WHERE id = $1 AND age >= $2 AND age < $3 AND active = $4"
        );
        assert_eq!(
            query.values(),
            &[
                SqlValue::I32(7),
                SqlValue::I32(21),
                SqlValue::I32(65),
                SqlValue::Bool(true),
            ]
        );
    }

    #[test]
    fn test_none_binds_null() {
        let missing: Option<String> = None;
        let query = sql!("UPDATE users SET nickname = " {missing});

        assert_eq!(query.text(), "UPDATE users SET nickname = $1");
        assert_eq!(query.values(), &[SqlValue::Null]);
    }

    #[test]
    fn test_join_empty_fails() {
        let err = join(Vec::<Arg>::new()).unwrap_err();
        assert!(matches!(err, PgError::EmptyJoin));
    }

    #[test]
    fn test_join_with_separator_prefix_suffix() {
        let joined = join_with(vec![1, 2, 3], " + ", "(", ")").unwrap();

        assert_eq!(joined.text(), "($1 + $2 + $3)");
        assert_eq!(
            joined.values(),
            &[SqlValue::I32(1), SqlValue::I32(2), SqlValue::I32(3)]
        );
    }

    #[test]
    fn test_join_mixed_fragments_and_values() {
        let joined = join(vec![
            Arg::from(raw("id")),
            Arg::from(10),
            Arg::from(sql!("lower(" {"X"} ")")),
        ])
        .unwrap();

        assert_eq!(joined.text(), "id, $1, lower($2)");
        assert_eq!(
            joined.values(),
            &[SqlValue::I32(10), SqlValue::Text("X".to_string())]
        );
    }

    #[test]
    fn test_builder_chaining() {
        let mut builder = SqlBuilder::new();
        builder.text("SELECT * FROM events WHERE kind = ").arg("login");
        builder.text(" LIMIT ").arg(50i64);
        let query = builder.finish();

        assert_eq!(
            query.text(),
            "SELECT * FROM events WHERE kind = $1 LIMIT $2"
        );
        assert_eq!(
            query.values(),
            &[SqlValue::Text("login".to_string()), SqlValue::I64(50)]
        );
    }

    #[test]
    fn test_dedent_multiline() {
        let query = sql!(r#"
            SELECT id
            FROM users
            WHERE banned = false
        "#);

        assert_eq!(
            query.text(),
            "SELECT id\nFROM users\nWHERE banned = false"
        );
    }

    #[test]
    fn test_empty_fragment() {
        let clause = empty();
        let query = sql!("SELECT 1" {clause});

        assert_eq!(query.text(), "SELECT 1");
        assert!(query.values().is_empty());
    }
}
