//! Azure Instance Metadata Service (IMDS) client.
//!
//! Only reachable from inside a VM at the well-known link-local address; the
//! base is a field so tests can stand in a mock server.

use crate::error::{RestError, RestResult};
use serde_json::Value;
use std::time::Duration;

/// Well-known link-local IMDS address.
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254";

/// IMDS answers fast or not at all; bound every query.
const IMDS_TIMEOUT_SECS: u64 = 5;

pub struct InstanceMetadata {
    http: reqwest::Client,
    endpoint: String,
}

impl Default for InstanceMetadata {
    fn default() -> Self {
        Self::new().expect("reqwest client construction cannot fail with static options")
    }
}

impl InstanceMetadata {
    pub fn new() -> RestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(IMDS_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            endpoint: IMDS_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn get(&self, path_and_query: &str) -> RestResult<Value> {
        let url = format!("{}{}", self.endpoint, path_and_query);
        let response = self
            .http
            .get(&url)
            .header("Metadata", "true")
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::Status {
                status,
                body,
                retry_after: None,
            });
        }
        Ok(response.json().await?)
    }

    /// The full instance document.
    pub async fn instance(&self) -> RestResult<Value> {
        self.get("/metadata/instance?api-version=2020-06-01").await
    }

    /// The image reference this VM was provisioned from; drives image
    /// resolution when the caller supplies none.
    pub async fn image_reference(&self) -> RestResult<Value> {
        self.get(
            "/metadata/instance/compute/storageProfile/imageReference?api-version=2019-06-01",
        )
        .await
    }

    /// Pending scheduled events for this VM.
    pub async fn scheduled_events(&self) -> RestResult<Value> {
        self.get("/metadata/scheduledevents?api-version=2019-08-01")
            .await
    }

    /// True iff a `Preempt` event is scheduled (spot eviction notice).
    pub async fn preempted(&self) -> RestResult<bool> {
        let events = self.scheduled_events().await?;
        Ok(events
            .get("Events")
            .and_then(Value::as_array)
            .map(|events| {
                events
                    .iter()
                    .any(|e| e.get("EventType").and_then(Value::as_str) == Some("Preempt"))
            })
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn imds_for(server: &MockServer) -> InstanceMetadata {
        InstanceMetadata::new().unwrap().with_endpoint(server.uri())
    }

    #[tokio::test]
    async fn test_metadata_header_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/instance"))
            .and(header("Metadata", "true"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"compute": {"name": "vm0"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let imds = imds_for(&server).await;
        let doc = imds.instance().await.unwrap();
        assert_eq!(doc["compute"]["name"], "vm0");
    }

    #[tokio::test]
    async fn test_preempted_true_on_preempt_event() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/scheduledevents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Events": [
                    {"EventType": "Freeze"},
                    {"EventType": "Preempt"}
                ]
            })))
            .mount(&server)
            .await;

        let imds = imds_for(&server).await;
        assert!(imds.preempted().await.unwrap());
    }

    #[tokio::test]
    async fn test_preempted_false_without_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/scheduledevents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Events": []})))
            .mount(&server)
            .await;

        let imds = imds_for(&server).await;
        assert!(!imds.preempted().await.unwrap());
    }
}
