//! Composable row predicates and the scoped query handle they are applied to.
//!
//! A [`Predicate`] is a small boolean tree over integer columns. It can be
//! rendered into a parameterised PostgreSQL `WHERE` clause through
//! [`sqlx::QueryBuilder`], or evaluated in memory against a row given as a
//! JSON object.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    True,
    False,
    Eq { column: String, value: i64 },
    In { column: String, values: BTreeSet<i64> },
    /// The column holds a JSON array sharing at least one element with `values`.
    JsonContainsAny { column: String, values: BTreeSet<i64> },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: i64) -> Self {
        Predicate::Eq {
            column: column.into(),
            value,
        }
    }

    /// `column IN values`; an empty set matches nothing.
    pub fn in_set(column: impl Into<String>, values: impl IntoIterator<Item = i64>) -> Self {
        let values: BTreeSet<i64> = values.into_iter().collect();
        if values.is_empty() {
            return Predicate::False;
        }
        Predicate::In {
            column: column.into(),
            values,
        }
    }

    /// JSON-array membership; an empty set matches nothing.
    pub fn json_contains_any(
        column: impl Into<String>,
        values: impl IntoIterator<Item = i64>,
    ) -> Self {
        let values: BTreeSet<i64> = values.into_iter().collect();
        if values.is_empty() {
            return Predicate::False;
        }
        Predicate::JsonContainsAny {
            column: column.into(),
            values,
        }
    }

    /// Conjunction. `True` operands are dropped, any `False` operand wins,
    /// nested conjunctions are flattened.
    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        let mut operands = Vec::new();
        for p in predicates {
            match p {
                Predicate::True => {}
                Predicate::False => return Predicate::False,
                Predicate::And(inner) => operands.extend(inner),
                other => operands.push(other),
            }
        }
        match operands.len() {
            0 => Predicate::True,
            1 => operands.remove(0),
            _ => Predicate::And(operands),
        }
    }

    /// Disjunction. `False` operands are dropped, any `True` operand wins,
    /// nested disjunctions are flattened.
    pub fn or(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        let mut operands = Vec::new();
        for p in predicates {
            match p {
                Predicate::False => {}
                Predicate::True => return Predicate::True,
                Predicate::Or(inner) => operands.extend(inner),
                other => operands.push(other),
            }
        }
        match operands.len() {
            0 => Predicate::False,
            1 => operands.remove(0),
            _ => Predicate::Or(operands),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Predicate::False)
    }

    /// Evaluate against a row given as a JSON object. Missing or non-integer
    /// columns never match.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::Eq { column, value } => int_column(row, column) == Some(*value),
            Predicate::In { column, values } => {
                int_column(row, column).is_some_and(|v| values.contains(&v))
            }
            Predicate::JsonContainsAny { column, values } => row
                .get(column)
                .and_then(Value::as_array)
                .is_some_and(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_i64)
                        .any(|v| values.contains(&v))
                }),
            Predicate::And(ps) => ps.iter().all(|p| p.matches(row)),
            Predicate::Or(ps) => ps.iter().any(|p| p.matches(row)),
        }
    }

    /// Render as SQL into `builder`, binding every value as a parameter.
    /// Column names are qualified with `qualifier` when given.
    pub fn push_sql(&self, builder: &mut QueryBuilder<'_, Postgres>, qualifier: Option<&str>) {
        match self {
            Predicate::True => {
                builder.push("TRUE");
            }
            Predicate::False => {
                builder.push("FALSE");
            }
            Predicate::Eq { column, value } => {
                builder.push(qualified(qualifier, column));
                builder.push(" = ");
                builder.push_bind(*value);
            }
            Predicate::In { column, values } => {
                builder.push(qualified(qualifier, column));
                builder.push(" = ANY(");
                builder.push_bind(values.iter().copied().collect::<Vec<i64>>());
                builder.push(")");
            }
            Predicate::JsonContainsAny { column, values } => {
                builder.push("EXISTS (SELECT 1 FROM jsonb_array_elements_text(");
                builder.push(qualified(qualifier, column));
                // json and text columns carry the same array
                builder.push("::jsonb) AS member(unit) WHERE member.unit::bigint = ANY(");
                builder.push_bind(values.iter().copied().collect::<Vec<i64>>());
                builder.push("))");
            }
            Predicate::And(ps) => push_joined(builder, qualifier, ps, " AND "),
            Predicate::Or(ps) => push_joined(builder, qualifier, ps, " OR "),
        }
    }
}

fn int_column(row: &Value, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

fn push_joined(
    builder: &mut QueryBuilder<'_, Postgres>,
    qualifier: Option<&str>,
    operands: &[Predicate],
    separator: &str,
) {
    builder.push("(");
    for (i, p) in operands.iter().enumerate() {
        if i > 0 {
            builder.push(separator);
        }
        p.push_sql(builder, qualifier);
    }
    builder.push(")");
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(qualifier: Option<&str>, column: &str) -> String {
    match qualifier {
        Some(q) => format!("{}.{}", quote_ident(q), quote_ident(column)),
        None => quote_ident(column),
    }
}

fn fmt_set(f: &mut fmt::Formatter<'_>, values: &BTreeSet<i64>) -> fmt::Result {
    f.write_str("(")?;
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", v)?;
    }
    f.write_str(")")
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::True => f.write_str("TRUE"),
            Predicate::False => f.write_str("FALSE"),
            Predicate::Eq { column, value } => write!(f, "{} = {}", column, value),
            Predicate::In { column, values } => {
                write!(f, "{} IN ", column)?;
                fmt_set(f, values)
            }
            Predicate::JsonContainsAny { column, values } => {
                write!(f, "{} CONTAINS ANY ", column)?;
                fmt_set(f, values)
            }
            Predicate::And(ps) | Predicate::Or(ps) => {
                let sep = if matches!(self, Predicate::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                f.write_str("(")?;
                for (i, p) in ps.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{}", p)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A query against one table plus the clauses ANDed onto it, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedQuery {
    table: String,
    clauses: Vec<Predicate>,
}

impl ScopedQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            clauses: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// AND a clause onto the query. `True` clauses are not recorded.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        if !predicate.is_true() {
            self.clauses.push(predicate);
        }
        self
    }

    pub fn clauses(&self) -> &[Predicate] {
        &self.clauses
    }

    pub fn is_unfiltered(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Conjunction of every clause.
    pub fn predicate(&self) -> Predicate {
        Predicate::and(self.clauses.iter().cloned())
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.clauses.iter().all(|c| c.matches(row))
    }

    /// Append ` WHERE ...` to `builder`; nothing when unfiltered.
    pub fn push_where(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if self.clauses.is_empty() {
            return;
        }
        builder.push(" WHERE ");
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                builder.push(" AND ");
            }
            clause.push_sql(builder, Some(&self.table));
        }
    }
}
