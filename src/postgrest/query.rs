//! Typed query builder over a [`Gateway`]

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Error;
use crate::postgrest::filter::{Filter, FilterOperator};
use crate::postgrest::types::{Query, SortOrder};
use crate::postgrest::Gateway;

/// Builder for requests against a single table
#[derive(Clone)]
pub struct TableQuery {
    gateway: Arc<dyn Gateway>,
    table: String,
    query: Query,
}

impl TableQuery {
    /// Create a new TableQuery
    pub fn new(gateway: Arc<dyn Gateway>, table: &str) -> Self {
        Self {
            gateway,
            table: table.to_string(),
            query: Query::default(),
        }
    }

    /// Select specific columns
    pub fn select(mut self, columns: &str) -> Self {
        self.query.columns = columns.to_string();
        self
    }

    fn filter(mut self, column: &str, operator: FilterOperator, value: impl ToString) -> Self {
        self.query.filters.push(Filter::new(column, operator, value));
        self
    }

    /// Filter rows where column equals a value
    pub fn eq(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, FilterOperator::Eq, value)
    }

    /// Filter rows where column is greater than or equal to a value
    pub fn gte(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, FilterOperator::Gte, value)
    }

    /// Filter rows where column is less than or equal to a value
    pub fn lte(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, FilterOperator::Lte, value)
    }

    /// Order the results by a column
    pub fn order(mut self, column: &str, order: SortOrder) -> Self {
        self.query.order = Some((column.to_string(), order));
        self
    }

    /// Limit the number of rows returned
    pub fn limit(mut self, count: usize) -> Self {
        self.query.limit = Some(count);
        self
    }

    /// The request this builder describes
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Fetch all matching rows
    pub async fn execute<T: DeserializeOwned>(&self) -> Result<Vec<T>, Error> {
        let rows = self.gateway.select(&self.table, &self.query).await?;
        decode_rows(rows)
    }

    /// Fetch the first matching row, if any
    pub async fn maybe_single<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        let mut query = self.query.clone();
        query.limit = Some(1);
        let rows = self.gateway.select(&self.table, &query).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }

    /// Insert one row and return its stored representation
    pub async fn insert<T: Serialize, R: DeserializeOwned>(&self, values: &T) -> Result<R, Error> {
        let row = serde_json::to_value(values)?;
        let inserted = self.gateway.insert(&self.table, vec![row]).await?;
        match inserted.into_iter().next() {
            Some(row) => Ok(serde_json::from_value(row)?),
            None => Err(Error::database(format!(
                "insert into {} returned no rows",
                self.table
            ))),
        }
    }

    /// Update the matching rows and return them
    pub async fn update<T: Serialize, R: DeserializeOwned>(
        &self,
        values: &T,
    ) -> Result<Vec<R>, Error> {
        self.require_filters("update")?;
        let values = serde_json::to_value(values)?;
        let updated = self
            .gateway
            .update(&self.table, &self.query.filters, values)
            .await?;
        decode_rows(updated)
    }

    /// Delete the matching rows and return them
    pub async fn delete<R: DeserializeOwned>(&self) -> Result<Vec<R>, Error> {
        self.require_filters("delete")?;
        let deleted = self.gateway.delete(&self.table, &self.query.filters).await?;
        decode_rows(deleted)
    }

    fn require_filters(&self, action: &str) -> Result<(), Error> {
        if self.query.filters.is_empty() {
            return Err(Error::general(format!(
                "refusing to {} every row of {}",
                action, self.table
            )));
        }
        Ok(())
    }
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, Error> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Error::from))
        .collect()
}
