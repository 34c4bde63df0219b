//! Session lifecycle notifications for observability and billing
//! collaborators.
//!
//! Two events per session: "connection started" when the WebSocket is
//! accepted (before the token is looked at) and "connection ended" after the
//! final close. The payload carries the resource identifier the client
//! declared in its request, never anything from the decrypted token.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives session lifecycle notifications. Implementations must not block.
pub trait LifecycleObserver: Send + Sync {
    fn connection_started(&self, session_id: u64, resource: Option<&str>);
    fn connection_ended(&self, session_id: u64, resource: Option<&str>);
}

/// Logs lifecycle events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl LifecycleObserver for LogObserver {
    fn connection_started(&self, session_id: u64, resource: Option<&str>) {
        info!(session_id, resource = resource.unwrap_or("-"), "connection started");
    }

    fn connection_ended(&self, session_id: u64, resource: Option<&str>) {
        info!(session_id, resource = resource.unwrap_or("-"), "connection ended");
    }
}

#[derive(Debug, Serialize)]
struct WebhookEvent<'a> {
    event: &'a str,
    session_id: u64,
    resource: Option<&'a str>,
}

/// POSTs lifecycle events as JSON to a fixed URL, best-effort.
pub struct WebhookObserver {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookObserver {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn post(&self, event: &str, session_id: u64, resource: Option<&str>) {
        let request = self.http_client.post(&self.url).json(&WebhookEvent {
            event,
            session_id,
            resource,
        });
        let url = self.url.clone();

        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %url, session_id, "webhook delivered");
                }
                Ok(resp) => {
                    warn!(url = %url, session_id, status = %resp.status(), "webhook rejected");
                }
                Err(e) => {
                    warn!(url = %url, session_id, error = %e, "webhook delivery failed");
                }
            }
        });
    }
}

impl LifecycleObserver for WebhookObserver {
    fn connection_started(&self, session_id: u64, resource: Option<&str>) {
        self.post("connection_started", session_id, resource);
    }

    fn connection_ended(&self, session_id: u64, resource: Option<&str>) {
        self.post("connection_ended", session_id, resource);
    }
}

/// Fans each event out to several observers in order.
#[derive(Default, Clone)]
pub struct Observers(Vec<Arc<dyn LifecycleObserver>>);

impl Observers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.0.push(observer);
        self
    }
}

impl LifecycleObserver for Observers {
    fn connection_started(&self, session_id: u64, resource: Option<&str>) {
        for o in &self.0 {
            o.connection_started(session_id, resource);
        }
    }

    fn connection_ended(&self, session_id: u64, resource: Option<&str>) {
        for o in &self.0 {
            o.connection_ended(session_id, resource);
        }
    }
}
