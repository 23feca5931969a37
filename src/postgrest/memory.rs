//! In-process gateway with the same filtering semantics as the REST one

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::Error;
use crate::postgrest::filter::{compare_text, scalar_text, Filter};
use crate::postgrest::types::{format_timestamp, Operation, Query, SortOrder};
use crate::postgrest::Gateway;
use crate::realtime::{ChangeEvent, ChangeFeed, RealtimeEventType};

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Value>>,
    next_id: HashMap<String, i64>,
    failures: Vec<(String, Operation)>,
    last_created: Option<DateTime<Utc>>,
}

impl MemoryState {
    /// Fail once if a failure was queued for this table and operation
    fn take_failure(&mut self, table: &str, operation: Operation) -> Result<(), Error> {
        if let Some(pos) = self
            .failures
            .iter()
            .position(|(t, op)| t == table && *op == operation)
        {
            self.failures.remove(pos);
            return Err(Error::database(format!(
                "injected {:?} failure on {}",
                operation, table
            )));
        }
        Ok(())
    }

    /// Strictly increasing creation timestamps keep ordering stable
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_created {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created = Some(stamp);
        stamp
    }
}

/// Gateway that keeps every table in memory
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    feed: Option<ChangeFeed>,
    schema: String,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    /// Create an empty gateway that publishes no change events
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            feed: None,
            schema: "public".to_string(),
        }
    }

    /// Create an empty gateway that publishes every mutation to `feed`
    pub fn with_feed(feed: ChangeFeed) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new()
        }
    }

    /// Make the next `operation` on `table` fail
    pub fn fail_next(&self, table: &str, operation: Operation) {
        if let Ok(mut state) = self.lock() {
            state.failures.push((table.to_string(), operation));
        }
    }

    /// Snapshot of every row in a table
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock()
            .map(|state| state.tables.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::general("memory gateway lock poisoned"))
    }

    fn publish(&self, table: &str, event_type: RealtimeEventType, changes: Vec<(Option<Value>, Option<Value>)>) {
        let Some(feed) = &self.feed else {
            return;
        };
        let commit_timestamp = format_timestamp(Utc::now());
        for (new, old) in changes {
            feed.publish(ChangeEvent {
                schema: self.schema.clone(),
                table: table.to_string(),
                commit_timestamp: commit_timestamp.clone(),
                event_type: event_type.clone(),
                new,
                old,
            });
        }
    }
}

fn matches_all(row: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| filter.matches(row))
}

fn sort_rows(rows: &mut [Value], column: &str, order: SortOrder) {
    rows.sort_by(|a, b| {
        let left = a.get(column).and_then(scalar_text);
        let right = b.get(column).and_then(scalar_text);
        // nulls sort last in both directions
        match (left, right) {
            (Some(l), Some(r)) => match order {
                SortOrder::Ascending => compare_text(&l, &r),
                SortOrder::Descending => compare_text(&r, &l),
            },
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
    });
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, Error> {
        let mut state = self.lock()?;
        state.take_failure(table, Operation::Select)?;

        let mut rows: Vec<Value> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_all(row, &query.filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((column, order)) = &query.order {
            sort_rows(&mut rows, column, *order);
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, Error> {
        let inserted = {
            let mut state = self.lock()?;
            state.take_failure(table, Operation::Insert)?;

            let mut inserted = Vec::with_capacity(rows.len());
            for row in rows {
                let Value::Object(mut fields) = row else {
                    return Err(Error::database(format!(
                        "insert into {} expects JSON objects",
                        table
                    )));
                };

                let has_id = fields.get("id").map(|id| !id.is_null()).unwrap_or(false);
                if !has_id {
                    let next = state.next_id.entry(table.to_string()).or_insert(0);
                    *next += 1;
                    let id = *next;
                    fields.insert("id".to_string(), Value::from(id));
                }
                let has_created = fields
                    .get("created_at")
                    .map(|c| !c.is_null())
                    .unwrap_or(false);
                if !has_created {
                    let created_at = state.next_created_at();
                    fields.insert(
                        "created_at".to_string(),
                        Value::from(format_timestamp(created_at)),
                    );
                }

                inserted.push(Value::Object(fields));
            }

            state
                .tables
                .entry(table.to_string())
                .or_default()
                .extend(inserted.iter().cloned());
            inserted
        };

        self.publish(
            table,
            RealtimeEventType::Insert,
            inserted.iter().map(|row| (Some(row.clone()), None)).collect(),
        );
        Ok(inserted)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        values: Value,
    ) -> Result<Vec<Value>, Error> {
        let Value::Object(patch) = values else {
            return Err(Error::database(format!(
                "update of {} expects a JSON object",
                table
            )));
        };

        let changes = {
            let mut state = self.lock()?;
            state.take_failure(table, Operation::Update)?;

            let mut changes = Vec::new();
            if let Some(rows) = state.tables.get_mut(table) {
                for row in rows.iter_mut().filter(|row| matches_all(row, filters)) {
                    let old = row.clone();
                    if let Value::Object(fields) = row {
                        for (key, value) in &patch {
                            fields.insert(key.clone(), value.clone());
                        }
                    }
                    changes.push((Some(row.clone()), Some(old)));
                }
            }
            changes
        };

        let updated = changes.iter().filter_map(|(new, _)| new.clone()).collect();
        self.publish(table, RealtimeEventType::Update, changes);
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, Error> {
        let deleted = {
            let mut state = self.lock()?;
            state.take_failure(table, Operation::Delete)?;

            match state.tables.get_mut(table) {
                Some(rows) => {
                    let (deleted, kept): (Vec<Value>, Vec<Value>) = rows
                        .drain(..)
                        .partition(|row| matches_all(row, filters));
                    *rows = kept;
                    deleted
                }
                None => Vec::new(),
            }
        };

        self.publish(
            table,
            RealtimeEventType::Delete,
            deleted.iter().map(|row| (None, Some(row.clone()))).collect(),
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgrest::FilterOperator;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_ids_and_timestamps() {
        let gateway = MemoryGateway::new();
        let rows = gateway
            .insert("leads", vec![json!({ "customer_name": "A" }), json!({ "customer_name": "B" })])
            .await
            .unwrap();

        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[1]["id"], 2);
        assert!(rows[0]["created_at"].is_string());
        assert!(rows[0]["created_at"].as_str() < rows[1]["created_at"].as_str());
    }

    #[tokio::test]
    async fn test_select_filters_orders_and_limits() {
        let gateway = MemoryGateway::new();
        gateway
            .insert(
                "stock",
                vec![
                    json!({ "device_registration_number": "B", "current_status": "available" }),
                    json!({ "device_registration_number": "A", "current_status": "available" }),
                    json!({ "device_registration_number": "C", "current_status": "assigned" }),
                ],
            )
            .await
            .unwrap();

        let query = Query {
            filters: vec![Filter::new("current_status", FilterOperator::Eq, "available")],
            order: Some(("device_registration_number".to_string(), SortOrder::Ascending)),
            limit: Some(1),
            ..Query::default()
        };
        let rows = gateway.select("stock", &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["device_registration_number"], "A");
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let gateway = MemoryGateway::new();
        gateway.fail_next("inward_devices", Operation::Delete);

        let filters = [Filter::new("id", FilterOperator::Eq, 1)];
        assert!(gateway.delete("inward_devices", &filters).await.is_err());
        assert!(gateway.delete("inward_devices", &filters).await.is_ok());
    }

    #[tokio::test]
    async fn test_mutations_are_published() {
        let feed = ChangeFeed::new(16);
        let mut subscription = feed.subscribe("customers");
        let gateway = MemoryGateway::with_feed(feed);

        gateway
            .insert("customers", vec![json!({ "customer_name": "Acme" })])
            .await
            .unwrap();
        gateway
            .update(
                "customers",
                &[Filter::new("id", FilterOperator::Eq, 1)],
                json!({ "status": "closed" }),
            )
            .await
            .unwrap();

        let first = subscription.recv().await.unwrap().into_change().unwrap();
        assert_eq!(first.event_type, RealtimeEventType::Insert);
        let second = subscription.recv().await.unwrap().into_change().unwrap();
        assert_eq!(second.event_type, RealtimeEventType::Update);
        assert_eq!(second.new.unwrap()["status"], "closed");
    }
}
