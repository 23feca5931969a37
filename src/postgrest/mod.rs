//! Table access through the PostgREST API
//!
//! Domain services talk to a [`Gateway`]: [`RestGateway`] for the hosted
//! backend, [`MemoryGateway`] for tests and offline use.

mod filter;
mod memory;
mod query;
mod types;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::config::{Credentials, DeskOptions};
use crate::error::Error;
use crate::fetch::{Fetch, FetchBuilder};

pub use filter::*;
pub use memory::MemoryGateway;
pub use query::*;
pub use types::*;

/// Query/mutation surface of the data backend
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Fetch rows matching the query
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, Error>;

    /// Insert rows, returning them as stored
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, Error>;

    /// Update rows matching every filter, returning the updated rows
    async fn update(&self, table: &str, filters: &[Filter], values: Value)
        -> Result<Vec<Value>, Error>;

    /// Delete rows matching every filter, returning the deleted rows
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, Error>;
}

/// Gateway backed by a PostgREST endpoint
pub struct RestGateway {
    /// The base URL for the backend project
    url: String,

    /// The API key for the backend project
    key: String,

    /// The database schema
    schema: String,

    /// Per-request timeout
    timeout: Option<Duration>,

    /// HTTP client
    client: Client,
}

impl RestGateway {
    /// Create a new RestGateway
    pub fn new(credentials: &Credentials, options: &DeskOptions) -> Self {
        Self::with_client(credentials, options, Client::new())
    }

    /// Create a new RestGateway sharing an existing HTTP client
    pub fn with_client(credentials: &Credentials, options: &DeskOptions, client: Client) -> Self {
        Self {
            url: credentials.url.trim_end_matches('/').to_string(),
            key: credentials.key.clone(),
            schema: options.db_schema.clone(),
            timeout: options.request_timeout,
            client,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.url, table)
    }

    fn prepare<'a>(&self, fetch: FetchBuilder<'a>, writes: bool) -> Result<FetchBuilder<'a>, Error> {
        let mut fetch = fetch
            .header("apikey", &self.key)?
            .bearer_auth(&self.key)?
            .header("X-Client-Info", "fleetdesk/0.1.0")?
            .timeout(self.timeout);

        if writes {
            fetch = fetch.header("Prefer", "return=representation")?;
        }

        if self.schema != "public" {
            let profile = if writes {
                "Content-Profile"
            } else {
                "Accept-Profile"
            };
            fetch = fetch.header(profile, &self.schema)?;
        }

        Ok(fetch)
    }
}

/// PostgREST answers with an array; tolerate an empty body or a single object
fn into_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(Filter::to_param).collect()
}

#[async_trait]
impl Gateway for RestGateway {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, Error> {
        let url = self.table_url(table);
        let fetch = self
            .prepare(Fetch::get(&self.client, &url), false)?
            .query(&query.to_params());

        let rows = into_rows(fetch.execute().await?);
        log::debug!("select {} returned {} rows", table, rows.len());
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, Error> {
        let url = self.table_url(table);
        let fetch = self
            .prepare(Fetch::post(&self.client, &url), true)?
            .json(&rows)?;

        Ok(into_rows(fetch.execute().await?))
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        values: Value,
    ) -> Result<Vec<Value>, Error> {
        let url = self.table_url(table);
        let fetch = self
            .prepare(Fetch::patch(&self.client, &url), true)?
            .query(&filter_params(filters))
            .json(&values)?;

        Ok(into_rows(fetch.execute().await?))
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, Error> {
        let url = self.table_url(table);
        let fetch = self
            .prepare(Fetch::delete(&self.client, &url), true)?
            .query(&filter_params(filters));

        Ok(into_rows(fetch.execute().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(uri: &str) -> Arc<dyn Gateway> {
        let credentials = Credentials {
            url: uri.to_string(),
            key: "fake-key".to_string(),
        };
        Arc::new(RestGateway::new(&credentials, &DeskOptions::default()))
    }

    #[tokio::test]
    async fn test_select_encodes_filters_and_order() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/stock"))
            .and(query_param("select", "*"))
            .and(query_param("device_imei", "eq.356938035643809"))
            .and(query_param("order", "created_at.desc"))
            .and(header("apikey", "fake-key"))
            .and(header("Authorization", "Bearer fake-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": 1, "device_imei": "356938035643809" }
            ])))
            .mount(&mock_server)
            .await;

        let rows = TableQuery::new(gateway(&mock_server.uri()), "stock")
            .eq("device_imei", "356938035643809")
            .order("created_at", SortOrder::Descending)
            .execute::<Value>()
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_insert_asks_for_representation() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/leads"))
            .and(header("Prefer", "return=representation"))
            .and(body_json(json!([{ "customer_name": "Acme" }])))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                { "id": 10, "customer_name": "Acme" }
            ])))
            .mount(&mock_server)
            .await;

        let inserted: Value = TableQuery::new(gateway(&mock_server.uri()), "leads")
            .insert(&json!({ "customer_name": "Acme" }))
            .await
            .unwrap();

        assert_eq!(inserted["id"], 10);
    }

    #[tokio::test]
    async fn test_update_and_delete_send_filters() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/customers"))
            .and(query_param("id", "eq.3"))
            .and(body_json(json!({ "status": "closed" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": 3, "status": "closed" }
            ])))
            .mount(&mock_server)
            .await;

        Mock::given(method("DELETE"))
            .and(path("/rest/v1/inward_devices"))
            .and(query_param("device_registration_number", "eq.REG-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let gateway = gateway(&mock_server.uri());

        let updated: Vec<Value> = TableQuery::new(gateway.clone(), "customers")
            .eq("id", 3)
            .update(&json!({ "status": "closed" }))
            .await
            .unwrap();
        assert_eq!(updated[0]["status"], "closed");

        let deleted: Vec<Value> = TableQuery::new(gateway, "inward_devices")
            .eq("device_registration_number", "REG-1")
            .delete()
            .await
            .unwrap();
        assert!(deleted.is_empty());
    }

    #[tokio::test]
    async fn test_error_body_is_parsed() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/stock"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint",
                "details": null,
                "hint": null
            })))
            .mount(&mock_server)
            .await;

        let result: Result<Value, Error> = TableQuery::new(gateway(&mock_server.uri()), "stock")
            .insert(&json!({ "device_imei": "1" }))
            .await;

        match result {
            Err(Error::Api { details, status }) => {
                assert_eq!(status, 409);
                assert_eq!(details.code.as_deref(), Some("23505"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_unfiltered_delete_is_refused() {
        let mock_server = MockServer::start().await;
        let result: Result<Vec<Value>, Error> =
            TableQuery::new(gateway(&mock_server.uri()), "stock").delete().await;
        assert!(matches!(result, Err(Error::General(_))));
    }
}
