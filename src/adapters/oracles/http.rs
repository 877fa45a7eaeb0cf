//! JSON-over-HTTP reasoning oracle.
//!
//! Posts the situation together with the judgment schema to a configured
//! endpoint and hands the response body back untouched; the reasoning stage
//! does all validation.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::OracleConfig;
use crate::domain::ports::{OracleError, ReasoningOracle, Situation};

const DEFAULT_MODEL: &str = "fleet-judgment";

#[derive(Debug, Serialize)]
struct EvaluateRequest<'a> {
    model: &'a str,
    situation: &'a Situation,
    schema: &'a serde_json::Value,
}

/// Oracle backed by a remote judgment service.
pub struct HttpOracle {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpOracle {
    pub fn new(
        endpoint: impl Into<String>,
        model: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> DomainResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DomainError::ValidationFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key,
        })
    }

    /// Build from the `oracle` config section, reading the bearer token from
    /// the configured environment variable when it is set.
    pub fn from_config(config: &OracleConfig, timeout: Duration) -> DomainResult<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            DomainError::ValidationFailed("oracle.endpoint is required for the http oracle".to_string())
        })?;
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        Self::new(endpoint, config.model.clone(), api_key, timeout)
    }

    fn classify(status: StatusCode, body: String) -> OracleError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            OracleError::RateLimited
        } else if status.is_server_error() {
            OracleError::Unavailable(format!("HTTP {}: {}", status.as_u16(), body))
        } else {
            OracleError::Rejected(format!("HTTP {}: {}", status.as_u16(), body))
        }
    }
}

#[async_trait]
impl ReasoningOracle for HttpOracle {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn evaluate(
        &self,
        situation: &Situation,
        schema_hint: &serde_json::Value,
    ) -> Result<serde_json::Value, OracleError> {
        let request = EvaluateRequest {
            model: &self.model,
            situation,
            schema: schema_hint,
        };

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout
            } else {
                OracleError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }

        debug!(endpoint = %self.endpoint, status = status.as_u16(), "oracle responded");
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::FleetSnapshot;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn oracle(url: String, key: Option<&str>) -> HttpOracle {
        HttpOracle::new(
            format!("{}/evaluate", url),
            Some("test-model".into()),
            key.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn situation() -> Situation {
        Situation::from_snapshot(&FleetSnapshot::default())
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/evaluate")
            .match_header("content-type", "application/json")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(json!({"model": "test-model"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"issues":[],"confidence":0.9}"#)
            .create_async()
            .await;

        let body = oracle(server.url(), Some("secret"))
            .evaluate(&situation(), &json!({"type": "object"}))
            .await
            .unwrap();

        assert_eq!(body["confidence"], 0.9);
        mock.assert_async().await;
    }

    async fn error_for(status: usize) -> OracleError {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/evaluate")
            .with_status(status)
            .with_body("upstream said no")
            .create_async()
            .await;
        oracle(server.url(), None)
            .evaluate(&situation(), &json!({}))
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_status_mapping() {
        assert_eq!(error_for(429).await, OracleError::RateLimited);

        let err = error_for(503).await;
        assert!(matches!(err, OracleError::Unavailable(ref m) if m.contains("503")));
        assert!(err.is_transient());

        let err = error_for(400).await;
        assert!(matches!(err, OracleError::Rejected(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_non_json_body_is_invalid_response() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/evaluate")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let err = oracle(server.url(), None)
            .evaluate(&situation(), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::InvalidResponse(_)));
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let config = OracleConfig::default();
        assert!(HttpOracle::from_config(&config, Duration::from_secs(1)).is_err());
    }
}
