//! Transport of bulk requests.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::SubmissionError;

/// Basic-auth credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where bulk requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkTarget {
    pub url: String,
    pub credentials: Option<Credentials>,
}

/// Sends one framed bulk body and returns the raw response body.
#[async_trait]
pub trait BulkClient: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or the endpoint
    /// answers with a non-success status.
    async fn send_bulk(&self, target: &BulkTarget, body: String) -> Result<String, SubmissionError>;
}

/// [`BulkClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBulkClient {
    client: Client,
}

impl HttpBulkClient {
    pub fn new(timeout: Duration) -> Result<Self, SubmissionError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BulkClient for HttpBulkClient {
    async fn send_bulk(
        &self,
        target: &BulkTarget,
        body: String,
    ) -> Result<String, SubmissionError> {
        debug!(url = %target.url, bytes = body.len(), "Sending bulk request");

        let mut request = self
            .client
            .post(&target.url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        if let Some(credentials) = &target.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(SubmissionError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RESPONSE: &str = r#"{"took":1,"errors":false,"items":[{"delete":{"_id":"a","status":200}}]}"#;

    fn target(server: &MockServer, credentials: Option<Credentials>) -> BulkTarget {
        BulkTarget {
            url: format!("{}/_bulk", server.uri()),
            credentials,
        }
    }

    #[tokio::test]
    async fn test_posts_ndjson_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("content-type", "application/x-ndjson"))
            .and(header("authorization", "Basic dXNlcjpzZWNyZXQ="))
            .and(body_string("{\"delete\":{\"_id\":\"a\"}}\n"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RESPONSE))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpBulkClient::new(Duration::from_secs(5)).unwrap();
        let credentials = Credentials {
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        let body = client
            .send_bulk(
                &target(&server, Some(credentials)),
                "{\"delete\":{\"_id\":\"a\"}}\n".to_string(),
            )
            .await
            .unwrap();

        assert_eq!(body, RESPONSE);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let client = HttpBulkClient::new(Duration::from_secs(5)).unwrap();
        let err = client
            .send_bulk(&target(&server, None), String::new())
            .await
            .unwrap_err();

        match err {
            SubmissionError::Http { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_password_is_not_logged() {
        let credentials = Credentials {
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        assert!(!format!("{:?}", credentials).contains("secret"));
    }
}
