//! Types shared by the gateway implementations

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};

use crate::postgrest::filter::Filter;

/// Table names used by the dashboard
pub mod tables {
    pub const CUSTOMERS: &str = "customers";
    pub const LEADS: &str = "leads";
    pub const STOCK: &str = "stock";
    pub const INWARD_DEVICES: &str = "inward_devices";
    pub const OUTWARD_DEVICES: &str = "outward_devices";
    pub const SCHEDULED_EMAILS: &str = "scheduled_emails";
    pub const EMAIL_LOGS: &str = "email_logs";
    pub const CSV_IMPORT_LOGS: &str = "csv_import_logs";
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    /// Convert the direction to its PostgREST representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// Kind of remote call, used for failure injection and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

/// A select request against one table
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Columns to return, `*` by default
    pub columns: String,

    /// Row filters, all of which must match
    pub filters: Vec<Filter>,

    /// Optional ordering column and direction
    pub order: Option<(String, SortOrder)>,

    /// Optional maximum number of rows
    pub limit: Option<usize>,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            columns: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }
}

impl Query {
    /// Encode the query as PostgREST query parameters
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.columns.clone())];
        params.extend(self.filters.iter().map(Filter::to_param));
        if let Some((column, order)) = &self.order {
            params.push(("order".to_string(), format!("{}.{}", column, order.as_str())));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

/// Format a timestamp the way rows store it
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Deserialize `null` as the type's default, for text columns that may be null
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgrest::filter::FilterOperator;

    #[test]
    fn test_query_params() {
        let query = Query {
            filters: vec![
                Filter::new("status", FilterOperator::Eq, "pending"),
                Filter::new("scheduled_time", FilterOperator::Lte, "2024-01-01T00:00:00Z"),
            ],
            order: Some(("created_at".to_string(), SortOrder::Descending)),
            limit: Some(1),
            ..Query::default()
        };

        assert_eq!(
            query.to_params(),
            vec![
                ("select".to_string(), "*".to_string()),
                ("status".to_string(), "eq.pending".to_string()),
                (
                    "scheduled_time".to_string(),
                    "lte.2024-01-01T00:00:00Z".to_string()
                ),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "1".to_string()),
            ]
        );
    }
}
