//! HTTP request helper used by the REST gateway

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, Method, RequestBuilder, Response,
};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::{ApiErrorDetails, Error};

/// Helper for building and executing HTTP requests
pub struct FetchBuilder<'a> {
    client: &'a Client,
    url: String,
    method: Method,
    headers: HeaderMap,
    query_params: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl<'a> FetchBuilder<'a> {
    /// Create a new FetchBuilder
    pub fn new(client: &'a Client, url: &str, method: Method) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        Self {
            client,
            url: url.to_string(),
            method,
            headers,
            query_params: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Add a header to the request
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::general(format!("Invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::general(format!("Invalid header value for {}", name)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Add bearer token authentication to the request
    pub fn bearer_auth(self, token: &str) -> Result<Self, Error> {
        self.header("Authorization", &format!("Bearer {}", token))
    }

    /// Add query parameters; repeated keys are kept
    pub fn query(mut self, params: &[(String, String)]) -> Self {
        self.query_params.extend(params.iter().cloned());
        self
    }

    /// Add a JSON body to the request
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, Error> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    /// Set a per-request timeout
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn build(&self) -> Result<RequestBuilder, Error> {
        let mut url = Url::parse(&self.url)?;

        if !self.query_params.is_empty() {
            let mut query_pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                query_pairs.append_pair(key, value);
            }
        }

        let mut req = self
            .client
            .request(self.method.clone(), url.as_str())
            .headers(self.headers.clone());

        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        if let Some(body) = &self.body {
            req = req.body(body.clone());
        }

        Ok(req)
    }

    /// Execute the request and parse the body as JSON; an empty body is `Value::Null`
    pub async fn execute(&self) -> Result<Value, Error> {
        let response = self.execute_raw().await?;
        let status = response.status();
        let body_text = response.text().await?;

        if !status.is_success() {
            return Err(api_error(status.as_u16(), body_text));
        }

        if body_text.trim().is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_str(&body_text)?)
        }
    }

    /// Execute the request and return the raw response
    pub async fn execute_raw(&self) -> Result<Response, Error> {
        let req = self.build()?;
        Ok(req.send().await?)
    }
}

/// Map a failed response body onto the error type
fn api_error(status: u16, body_text: String) -> Error {
    match serde_json::from_str::<ApiErrorDetails>(&body_text) {
        Ok(details) if details.message.is_some() || details.code.is_some() => {
            Error::Api { details, status }
        }
        _ => Error::database(format!(
            "Request failed with status {}: {}",
            status, body_text
        )),
    }
}

/// Helper for creating HTTP requests
pub struct Fetch;

impl Fetch {
    /// Create a GET request
    pub fn get<'a>(client: &'a Client, url: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(client, url, Method::GET)
    }

    /// Create a POST request
    pub fn post<'a>(client: &'a Client, url: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(client, url, Method::POST)
    }

    /// Create a PATCH request
    pub fn patch<'a>(client: &'a Client, url: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(client, url, Method::PATCH)
    }

    /// Create a DELETE request
    pub fn delete<'a>(client: &'a Client, url: &str) -> FetchBuilder<'a> {
        FetchBuilder::new(client, url, Method::DELETE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_parses_postgrest_body() {
        let err = api_error(
            409,
            r#"{"code":"23505","message":"duplicate key value","details":null,"hint":null}"#
                .to_string(),
        );
        match err {
            Error::Api { details, status } => {
                assert_eq!(status, 409);
                assert_eq!(details.code.as_deref(), Some("23505"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_api_error_falls_back_to_raw_text() {
        let err = api_error(502, "Bad Gateway".to_string());
        assert!(matches!(err, Error::Database(ref m) if m.contains("502")));
    }
}
