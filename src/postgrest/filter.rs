//! Filter operations for gateway queries

use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use std::cmp::Ordering;

/// Operator for filter expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Equal to
    Eq,

    /// Not equal to
    Neq,

    /// Greater than
    Gt,

    /// Greater than or equal to
    Gte,

    /// Less than
    Lt,

    /// Less than or equal to
    Lte,

    /// Is (`null`, `true`, `false`)
    Is,

    /// In a list of values
    In,
}

impl FilterOperator {
    /// Convert the operator to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::Is => "is",
            FilterOperator::In => "in",
        }
    }
}

/// A single `column=op.value` condition
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: String,
}

impl Filter {
    pub fn new(column: &str, operator: FilterOperator, value: impl ToString) -> Self {
        Self {
            column: column.to_string(),
            operator,
            value: value.to_string(),
        }
    }

    /// Build an `in.(a,b,c)` filter
    pub fn in_list<T: ToString>(column: &str, values: &[T]) -> Self {
        let values: Vec<String> = values.iter().map(ToString::to_string).collect();
        Self::new(column, FilterOperator::In, format!("({})", values.join(",")))
    }

    /// Encode as a PostgREST query parameter
    pub fn to_param(&self) -> (String, String) {
        (
            self.column.clone(),
            format!("{}.{}", self.operator.as_str(), self.value),
        )
    }

    /// Evaluate the filter against a JSON row
    pub fn matches(&self, row: &Value) -> bool {
        let field = row.get(&self.column).and_then(scalar_text);

        match self.operator {
            FilterOperator::Is => match self.value.as_str() {
                "null" => field.is_none(),
                other => field.as_deref() == Some(other),
            },
            FilterOperator::In => {
                let list = self.value.trim_start_matches('(').trim_end_matches(')');
                match field {
                    Some(field) => list.split(',').any(|item| item.trim() == field),
                    None => false,
                }
            }
            op => {
                let Some(field) = field else {
                    return false;
                };
                // equality is exact text; only the range operators compare typed values
                if op == FilterOperator::Eq {
                    return field == self.value;
                }
                if op == FilterOperator::Neq {
                    return field != self.value;
                }
                let ordering = compare_text(&field, &self.value);
                match op {
                    FilterOperator::Gt => ordering == Ordering::Greater,
                    FilterOperator::Gte => ordering != Ordering::Less,
                    FilterOperator::Lt => ordering == Ordering::Less,
                    FilterOperator::Lte => ordering != Ordering::Greater,
                    _ => false,
                }
            }
        }
    }
}

/// Text form of a scalar JSON value; `None` for null, arrays and objects
pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Compare two column values, as timestamps, dates or numbers when both sides parse
pub(crate) fn compare_text(left: &str, right: &str) -> Ordering {
    if let (Ok(l), Ok(r)) = (
        DateTime::parse_from_rfc3339(left),
        DateTime::parse_from_rfc3339(right),
    ) {
        return l.cmp(&r);
    }
    if let (Ok(l), Ok(r)) = (left.parse::<NaiveDate>(), right.parse::<NaiveDate>()) {
        return l.cmp(&r);
    }
    if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return l.partial_cmp(&r).unwrap_or(Ordering::Equal);
    }
    left.cmp(right)
}
