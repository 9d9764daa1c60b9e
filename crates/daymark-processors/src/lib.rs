//! Downstream processor contracts + the adapters that reach the sessionizer.

use std::time::Duration;

use async_trait::async_trait;
use daymark_core::{EntityId, SessionizeParams};
use daymark_storage::{validate_identifier, BackoffPolicy, StorageError};
use reqwest::StatusCode;
use serde::Serialize;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "daymark-processors";

pub const DEFAULT_FUNCTION: &str = "sessionize_visits";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected sessionizer response: {0}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Config(#[from] StorageError),
}

/// The external sessionization step run once an entity's day has been claimed.
#[async_trait]
pub trait Sessionizer: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the number of rows/sessions the downstream step affected.
    async fn sessionize(
        &self,
        entity_id: EntityId,
        params: SessionizeParams,
    ) -> Result<i64, ProcessorError>;
}

/// Calls a SQL function `fn(uuid, integer, integer)` on the shared database.
#[derive(Debug, Clone)]
pub struct PgFunctionSessionizer {
    pool: PgPool,
    function: String,
}

impl PgFunctionSessionizer {
    pub fn new(pool: PgPool, function: &str) -> Result<Self, ProcessorError> {
        Ok(Self {
            pool,
            function: validate_identifier(function)?.to_string(),
        })
    }
}

#[async_trait]
impl Sessionizer for PgFunctionSessionizer {
    fn name(&self) -> &str {
        &self.function
    }

    async fn sessionize(
        &self,
        entity_id: EntityId,
        params: SessionizeParams,
    ) -> Result<i64, ProcessorError> {
        let sql = format!("SELECT {}($1, $2, $3)::bigint AS affected", self.function);
        let row = sqlx::query(&sql)
            .bind(entity_id)
            .bind(params.gap_threshold_minutes as i32)
            .bind(params.lookback_hours as i32)
            .fetch_one(&self.pool)
            .await?;
        let affected: Option<i64> = row.try_get("affected")?;
        Ok(affected.unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpSessionizerConfig {
    pub base_url: String,
    pub function: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpSessionizerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321/rest/v1".to_string(),
            function: DEFAULT_FUNCTION.to_string(),
            bearer_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionizeRequest {
    entity_id: EntityId,
    gap_threshold_minutes: u32,
    lookback_hours: u32,
}

/// Posts to `{base_url}/rpc/{function}` and expects an integer JSON body.
#[derive(Debug)]
pub struct HttpSessionizer {
    client: reqwest::Client,
    endpoint: String,
    function: String,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpSessionizer {
    pub fn new(config: HttpSessionizerConfig) -> Result<Self, ProcessorError> {
        let function = validate_identifier(&config.function)?.to_string();
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/rpc/{}", config.base_url.trim_end_matches('/'), function),
            function,
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post_with_retry(&self, body: &SessionizeRequest) -> Result<i64, ProcessorError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.post(&self.endpoint).json(body);
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let value: serde_json::Value = resp.json().await?;
                        return parse_affected(&value);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "sessionizer call retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ProcessorError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "sessionizer call retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ProcessorError::Request(err));
                }
            }
        }
    }
}

fn parse_affected(value: &serde_json::Value) -> Result<i64, ProcessorError> {
    match value {
        serde_json::Value::Null => Ok(0),
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ProcessorError::UnexpectedResponse(value.to_string())),
        _ => Err(ProcessorError::UnexpectedResponse(value.to_string())),
    }
}

#[async_trait]
impl Sessionizer for HttpSessionizer {
    fn name(&self) -> &str {
        &self.function
    }

    async fn sessionize(
        &self,
        entity_id: EntityId,
        params: SessionizeParams,
    ) -> Result<i64, ProcessorError> {
        let body = SessionizeRequest {
            entity_id,
            gap_threshold_minutes: params.gap_threshold_minutes,
            lookback_hours: params.lookback_hours,
        };
        let span = info_span!("sessionize_http", %entity_id, endpoint = %self.endpoint);
        self.post_with_retry(&body).instrument(span).await
    }
}

/// Logs the call and reports zero rows. Used for local runs against a registry file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunSessionizer;

#[async_trait]
impl Sessionizer for DryRunSessionizer {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn sessionize(
        &self,
        entity_id: EntityId,
        params: SessionizeParams,
    ) -> Result<i64, ProcessorError> {
        info!(
            %entity_id,
            gap_threshold_minutes = params.gap_threshold_minutes,
            lookback_hours = params.lookback_hours,
            "dry-run sessionize"
        );
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(server: &MockServer) -> HttpSessionizerConfig {
        HttpSessionizerConfig {
            base_url: format!("{}/rest/v1/", server.uri()),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn http_sessionizer_posts_parameters_and_reads_count() {
        let server = MockServer::start().await;
        let entity_id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/sessionize_visits"))
            .and(header("authorization", "Bearer service-key"))
            .and(body_json(json!({
                "entity_id": entity_id,
                "gap_threshold_minutes": 10,
                "lookback_hours": 24,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(7)))
            .expect(1)
            .mount(&server)
            .await;

        let sessionizer = HttpSessionizer::new(HttpSessionizerConfig {
            bearer_token: Some("service-key".into()),
            ..fast_config(&server)
        })
        .unwrap();
        let affected = sessionizer
            .sessionize(entity_id, SessionizeParams::default())
            .await
            .unwrap();
        assert_eq!(affected, 7);
    }

    #[tokio::test]
    async fn http_sessionizer_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/sessionize_visits"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/sessionize_visits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(3)))
            .mount(&server)
            .await;

        let sessionizer = HttpSessionizer::new(fast_config(&server)).unwrap();
        let affected = sessionizer
            .sessionize(Uuid::new_v4(), SessionizeParams::default())
            .await
            .unwrap();
        assert_eq!(affected, 3);
    }

    #[tokio::test]
    async fn http_sessionizer_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let sessionizer = HttpSessionizer::new(fast_config(&server)).unwrap();
        let err = sessionizer
            .sessionize(Uuid::new_v4(), SessionizeParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn function_names_are_validated() {
        let err = HttpSessionizer::new(HttpSessionizerConfig {
            function: "sessionize(); --".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ProcessorError::Config(_)));
    }

    #[test]
    fn endpoint_joins_base_url_and_function() {
        let sessionizer = HttpSessionizer::new(HttpSessionizerConfig {
            base_url: "https://example.test/rest/v1/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            sessionizer.endpoint(),
            "https://example.test/rest/v1/rpc/sessionize_visits"
        );
    }

    #[test]
    fn affected_count_accepts_integers_and_null() {
        assert_eq!(parse_affected(&json!(12)).unwrap(), 12);
        assert_eq!(parse_affected(&json!(null)).unwrap(), 0);
        assert!(parse_affected(&json!("twelve")).is_err());
        assert!(parse_affected(&json!(1.5)).is_err());
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }
}
