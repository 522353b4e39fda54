//! Generic HTTP webhook delivery.
//!
//! The alert is POSTed as a JSON document:
//!
//! ```json
//! {
//!   "title": "RESTRICTED ZONE BREACH",
//!   "message": "person entered Loading Dock",
//!   "severity": "high",
//!   "timestamp": "2026-01-01T12:00:00Z",
//!   "metadata": { "camera_id": "cam-01" }
//! }
//! ```

use std::time::Duration;

use tracing::debug;

use super::AlertProtocol;
use crate::error::DispatchError;
use crate::model::{Alert, BoxFuture};

/// Delivers alerts to an HTTP endpoint as JSON.
#[derive(Clone)]
pub struct WebhookProtocol {
    client: reqwest::Client,
    url: String,
    name: String,
}

impl WebhookProtocol {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            name: "webhook".to_string(),
        }
    }

    /// Apply a transport-level timeout in addition to the broadcaster's.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    /// Override the name shown in logs, useful when several webhooks are registered.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, alert: &Alert) -> Result<(), DispatchError> {
        let response = self.client.post(&self.url).json(alert).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!(url = %self.url, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}

impl AlertProtocol for WebhookProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(self.post(alert))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertSeverity;
    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    type Received = Arc<Mutex<Vec<Value>>>;

    async fn spawn_server(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));

        async fn hook(
            State((status, received)): State<(StatusCode, Received)>,
            Json(body): Json<Value>,
        ) -> StatusCode {
            received.lock().await.push(body);
            status
        }

        let app = Router::new()
            .route("/hook", post(hook))
            .with_state((status, received.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}/hook", addr), received)
    }

    #[tokio::test]
    async fn test_posts_alert_document() {
        let (url, received) = spawn_server(StatusCode::OK).await;
        let webhook = WebhookProtocol::new(&url);

        let alert = Alert::new("RESTRICTED ZONE BREACH", "person entered Dock", AlertSeverity::High)
            .with_metadata("camera_id", "cam-01")
            .with_metadata("zone_id", 3);

        webhook.dispatch(&alert).await.unwrap();

        let bodies = received.lock().await;
        assert_eq!(bodies.len(), 1);
        let body = &bodies[0];
        assert_eq!(body["title"], "RESTRICTED ZONE BREACH");
        assert_eq!(body["message"], "person entered Dock");
        assert_eq!(body["severity"], "high");
        assert!(body["timestamp"].is_string());
        assert_eq!(body["metadata"]["camera_id"], "cam-01");
        assert_eq!(body["metadata"]["zone_id"], 3);
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejection() {
        let (url, _received) = spawn_server(StatusCode::SERVICE_UNAVAILABLE).await;
        let webhook = WebhookProtocol::new(&url).with_name("ops-hook");
        assert_eq!(webhook.name(), "ops-hook");

        let alert = Alert::new("t", "m", AlertSeverity::Info);
        let err = webhook.dispatch(&alert).await.unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { status: 503 }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_http_error() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let webhook = WebhookProtocol::new(&format!("http://{}/hook", addr))
            .with_timeout(Duration::from_secs(2));
        let alert = Alert::new("t", "m", AlertSeverity::Info);
        let err = webhook.dispatch(&alert).await.unwrap_err();
        assert!(matches!(err, DispatchError::Http(_)));
    }
}
