//! Bearer-authenticated JSON wrappers over the Azure Resource Manager API.

use crate::error::{RestError, RestResult};
use crate::retry::{with_retry, RetryPolicy};
use http::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Azure Resource Manager endpoint.
pub const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// Request timeout for a single ARM call; retry handles the rest.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Source of bearer tokens. Token acquisition (OAuth, MSI, CLI caches) is an
/// external collaborator; implementations only need to hand back the current
/// token string.
pub trait SessionProvider: Send + Sync {
    fn token(&self) -> String;
}

/// A session around a fixed, externally acquired token.
pub struct StaticTokenSession {
    token: String,
}

impl StaticTokenSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl SessionProvider for StaticTokenSession {
    fn token(&self) -> String {
        self.token.clone()
    }
}

/// Authenticated ARM client with the retry policy applied to every call.
#[derive(Clone)]
pub struct AzureClient {
    http: reqwest::Client,
    session: Arc<dyn SessionProvider>,
    policy: RetryPolicy,
    endpoint: String,
    verbose: bool,
}

impl AzureClient {
    pub fn new(session: Arc<dyn SessionProvider>, policy: RetryPolicy) -> RestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            session,
            policy,
            endpoint: MANAGEMENT_ENDPOINT.to_string(),
            verbose: false,
        })
    }

    /// Point the client at a different ARM base (tests, sovereign clouds).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Absolute URL for an ARM path (`/subscriptions/...`).
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// One attempt: send, and promote any status >= 300 to `RestError::Status`
    /// so the retry policy can classify it.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> RestResult<reqwest::Response> {
        if self.verbose {
            info!(%method, url, "ARM request");
        } else {
            debug!(%method, url, "ARM request");
        }

        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.session.token()));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() >= 300 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::Status {
                status,
                body,
                retry_after,
            });
        }

        Ok(response)
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> RestResult<T> {
        with_retry(&self.policy, || async move {
            let response = self.send(Method::GET, url, None).await?;
            Ok(response.json().await?)
        })
        .await
    }

    pub async fn get_text(&self, url: &str) -> RestResult<String> {
        with_retry(&self.policy, || async move {
            let response = self.send(Method::GET, url, None).await?;
            Ok(response.text().await?)
        })
        .await
    }

    pub async fn put(&self, url: &str, body: &Value) -> RestResult<Value> {
        with_retry(&self.policy, || async move {
            let response = self.send(Method::PUT, url, Some(body)).await?;
            Ok(response.json().await.unwrap_or(Value::Null))
        })
        .await
    }

    pub async fn post(&self, url: &str, body: &Value) -> RestResult<()> {
        with_retry(&self.policy, || async move {
            self.send(Method::POST, url, Some(body)).await?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, url: &str) -> RestResult<()> {
        with_retry(&self.policy, || async move {
            self.send(Method::DELETE, url, None).await?;
            Ok(())
        })
        .await
    }

    /// GET a paged ARM listing, following `nextLink` with this client's
    /// session, and collect every `value` entry.
    pub async fn get_paged(&self, url: &str) -> RestResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut next = Some(url.to_string());

        while let Some(url) = next {
            let page: Value = self.get(&url).await?;
            if let Some(values) = page.get("value").and_then(Value::as_array) {
                items.extend(values.iter().cloned());
            }
            next = page
                .get("nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AzureClient {
        AzureClient::new(
            Arc::new(StaticTokenSession::new("test-token")),
            RetryPolicy::new(2),
        )
        .unwrap()
        .with_endpoint(server.uri())
    }

    #[tokio::test]
    async fn test_get_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/thing"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "x"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let body: Value = client.get(&client.url("/thing")).await.unwrap();
        assert_eq!(body["name"], "x");
    }

    #[tokio::test]
    async fn test_status_promotion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such resource"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .get::<Value>(&client.url("/missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        match err {
            RestError::Status { body, .. } => assert_eq!(body, "no such resource"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_get_paged_follows_next_link() {
        let server = MockServer::start().await;
        let second = format!("{}/page2", server.uri());
        Mock::given(method("GET"))
            .and(path("/page1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"value": [{"n": 1}], "nextLink": second})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"n": 2}]})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let items = client.get_paged(&client.url("/page1")).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["n"], 2);
    }

    #[tokio::test]
    async fn test_transient_500_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let body: Value = client.get(&client.url("/flaky")).await.unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_delete_propagates_404() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.delete(&client.url("/gone")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_with_query_api_version() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/res"))
            .and(query_param("api-version", "2019-12-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "res"})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let url = client.url("/res?api-version=2019-12-01");
        let body = client.put(&url, &json!({"location": "eastus"})).await.unwrap();
        assert_eq!(body["id"], "res");
    }
}
