//! Outbound HTTP client for subscriber endpoints.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use thiserror::Error;

use crate::config::DeliveryConfig;
use crate::scheduler::DeliveryJob;
use crate::signature::{
    canonical_payload, sign_raw, EVENT_ID_HEADER, EVENT_TYPE_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};

/// Why an attempt failed. Only the recorded message depends on this; every
/// variant is retried the same way.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Request timeout ({0}s)")]
    Timeout(u64),

    #[error("Host not found")]
    HostNotFound,

    #[error("HTTP {0}")]
    HttpStatus(u16),

    #[error("Request error: {0}")]
    Request(String),
}

/// Result of one POST to a subscriber.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<AttemptError>,
    pub latency: Duration,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct WebhookClient {
    http: Client,
    user_agent: String,
    timeout_secs: u64,
    response_body_limit: usize,
}

impl WebhookClient {
    pub fn new(config: &DeliveryConfig) -> Result<Self, reqwest::Error> {
        let user_agent = config.user_agent();
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            http,
            user_agent,
            timeout_secs: config.request_timeout_seconds,
            response_body_limit: config.response_body_limit,
        })
    }

    /// Signed headers for `body`, stamped with `timestamp`.
    pub fn build_headers(&self, job: &DeliveryJob, body: &str, timestamp: i64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let signature = sign_raw(body, &job.secret, timestamp);
        let pairs = [
            (USER_AGENT.as_str(), self.user_agent.as_str()),
            (SIGNATURE_HEADER, signature.as_str()),
            (EVENT_TYPE_HEADER, job.event_type.as_str()),
            (EVENT_ID_HEADER, job.event_id.as_str()),
        ];
        for (name, value) in pairs {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&timestamp.to_string()) {
            if let Ok(name) = HeaderName::from_bytes(TIMESTAMP_HEADER.as_bytes()) {
                headers.insert(name, value);
            }
        }

        headers
    }

    /// POST the job's payload. Never returns an error: failures are part of
    /// the outcome.
    #[tracing::instrument(
        name = "webhook.post",
        skip(self, job),
        fields(delivery_id = %job.delivery_id, attempt = job.attempt)
    )]
    pub async fn send(&self, job: &DeliveryJob) -> AttemptOutcome {
        let body = canonical_payload(&job.payload);
        let headers = self.build_headers(job, &body, Utc::now().timestamp());
        let start = Instant::now();

        let response = self
            .http
            .post(&job.url)
            .headers(headers)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let error = self.classify(&e);
                tracing::debug!(error = %e, classified = %error, "Webhook request failed");
                return AttemptOutcome {
                    status_code: None,
                    response_body: None,
                    error: Some(error),
                    latency: start.elapsed(),
                };
            }
        };

        let status = response.status().as_u16();
        let snippet: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(self.response_body_limit)
            .collect();

        AttemptOutcome {
            status_code: Some(status),
            response_body: Some(snippet),
            error: (!(200..300).contains(&status)).then_some(AttemptError::HttpStatus(status)),
            latency: start.elapsed(),
        }
    }

    fn classify(&self, err: &reqwest::Error) -> AttemptError {
        if err.is_timeout() {
            return AttemptError::Timeout(self.timeout_secs);
        }

        let mut source: Option<&(dyn StdError + 'static)> = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                if io.kind() == std::io::ErrorKind::ConnectionRefused {
                    return AttemptError::ConnectionRefused;
                }
                if io.kind() == std::io::ErrorKind::TimedOut {
                    return AttemptError::Timeout(self.timeout_secs);
                }
            }
            let text = cause.to_string().to_lowercase();
            if text.contains("dns error")
                || text.contains("failed to lookup address")
                || text.contains("name or service not known")
                || text.contains("no such host")
            {
                return AttemptError::HostNotFound;
            }
            if text.contains("connection refused") {
                return AttemptError::ConnectionRefused;
            }
            source = cause.source();
        }

        AttemptError::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_job;
    use crate::signature::{verify_at, DEFAULT_TOLERANCE_SECONDS};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> WebhookClient {
        WebhookClient::new(&DeliveryConfig::default()).unwrap()
    }

    #[test]
    fn test_headers_carry_verifiable_signature() {
        let job = test_job(1);
        let body = canonical_payload(&job.payload);
        let headers = client().build_headers(&job, &body, 1_700_000_000);

        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[USER_AGENT], "Ara-Webhook/1.0");
        assert_eq!(headers[EVENT_TYPE_HEADER], "order.created");
        assert_eq!(headers[EVENT_ID_HEADER], "evt_1");
        assert_eq!(headers[TIMESTAMP_HEADER], "1700000000");

        let signature = headers[SIGNATURE_HEADER].to_str().unwrap();
        assert!(signature.starts_with("t=1700000000,v1="));
        assert!(verify_at(
            &body,
            signature,
            &job.secret,
            DEFAULT_TOLERANCE_SECONDS,
            1_700_000_000
        ));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(AttemptError::HttpStatus(503).to_string(), "HTTP 503");
        assert_eq!(AttemptError::Timeout(30).to_string(), "Request timeout (30s)");
        assert_eq!(AttemptError::HostNotFound.to_string(), "Host not found");
    }

    #[tokio::test]
    async fn test_connection_refused_is_classified() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut job = test_job(1);
        job.url = format!("http://127.0.0.1:{port}/hook");
        let outcome = client().send(&job).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.status_code, None);
        assert_eq!(outcome.error, Some(AttemptError::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_response_body_capped_at_character_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("é".repeat(1500)))
            .mount(&server)
            .await;

        let mut job = test_job(1);
        job.url = format!("{}/hook", server.uri());
        let outcome = client().send(&job).await;

        assert!(outcome.is_success());
        let body = outcome.response_body.unwrap();
        assert_eq!(body.chars().count(), 1000);
        assert!(body.chars().all(|c| c == 'é'));
    }
}
