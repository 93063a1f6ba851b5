//! HTTP client for the admin API.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::de::DeserializeOwned;

use crate::error::CliError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a running proxy's admin API.
#[derive(Debug, Clone)]
pub struct AdminClient {
    client: reqwest::Client,
    base_url: String,
}

impl AdminClient {
    pub fn new(addr: SocketAddr) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: format!("http://{addr}"),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Make a GET request.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        self.handle_response(response).await
    }

    /// Make a POST request without a body.
    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self
            .client
            .post(self.url(path))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        self.handle_response(response).await
    }

    /// True when something answers `/healthz`.
    pub async fn is_up(&self) -> bool {
        matches!(
            self.client.get(self.url("/healthz")).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    fn map_send_error(&self, e: reqwest::Error) -> CliError {
        if e.is_connect() {
            CliError::NotRunning(self.base_url.clone())
        } else {
            CliError::Network(e)
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CliError> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to parse response: {}", e)))
        } else {
            let message = response
                .text()
                .await
                .ok()
                .filter(|body| !body.trim().is_empty())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
            Err(CliError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = AdminClient::new("127.0.0.1:8081".parse().unwrap()).unwrap();
        assert_eq!(client.url("/status"), "http://127.0.0.1:8081/status");
    }

    #[tokio::test]
    async fn test_unreachable_is_not_running() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = AdminClient::new(addr).unwrap();
        assert!(!client.is_up().await);
        let err = client.get::<serde_json::Value>("/status").await.unwrap_err();
        assert!(matches!(err, CliError::NotRunning(_)));
    }
}
