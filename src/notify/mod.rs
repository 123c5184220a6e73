use reqwest::Client;
use serde_json::json;

/// Fire-and-forget notification sink. Delivery failures must never affect
/// trading logic, so implementations log and swallow their own errors.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: String);
}

/// Posts messages as JSON to a webhook URL on a detached task
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, message: String) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let body = json!({ "content": message });
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!("Webhook returned {}", resp.status());
                }
                Err(e) => {
                    tracing::warn!("Webhook delivery failed: {}", e);
                }
            }
        });
    }
}

/// Used when notifications are disabled and in tests
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _message: String) {}
}
