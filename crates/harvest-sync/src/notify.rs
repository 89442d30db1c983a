use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

/// Operator notifications. Delivery is best-effort and never fails a cycle.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        info!(target: "harvest::notify", "{message}");
    }
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    message: &'a str,
}

/// Posts `{"message": ...}` to a chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("commenter-harvest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        let result = self
            .client
            .post(&self.url)
            .json(&WebhookBody { message })
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(err) = result {
            warn!(error = %err, "webhook notification failed");
        }
    }
}

/// Webhook when a URL is configured, log lines otherwise.
pub fn notifier_for(webhook_url: Option<&str>) -> anyhow::Result<Arc<dyn Notifier>> {
    match webhook_url.filter(|url| !url.trim().is_empty()) {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url)?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
