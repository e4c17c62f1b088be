//! HTTP implementations of the delivery collaborators.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::{NotificationReceipt, NotificationRequest, NotificationSender, WebhookRequest, WebhookSender};
use crate::{Error, Result};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

fn classify(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Provider(e.to_string())
    }
}

/// 5xx and 429 are worth retrying; any other non-success status is final.
fn check_status(target: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(Error::Provider(format!("{} responded with {}", target, status)))
    } else {
        Err(Error::Rejected(format!("{} responded with {}", target, status)))
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(alias = "id")]
    notification_id: String,
    #[serde(default = "default_status")]
    status: String,
}

fn default_status() -> String {
    "queued".to_string()
}

/// Posts notifications to the notification service's
/// `POST {base}/v1/notifications` endpoint.
pub struct HttpNotificationSender {
    client: Client,
    endpoint: Url,
}

impl HttpNotificationSender {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid notification service url: {}", e)))?;
        let endpoint = base
            .join("v1/notifications")
            .map_err(|e| Error::Config(format!("invalid notification service url: {}", e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl NotificationSender for HttpNotificationSender {
    async fn send(&self, request: NotificationRequest) -> Result<NotificationReceipt> {
        debug!(
            tenant_id = %request.tenant_id,
            channel = %request.channel,
            template_id = %request.template_id,
            "Sending notification"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .json(&request)
            .send()
            .await
            .map_err(classify)?;

        check_status("notification service", response.status())?;

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("unreadable notification response: {}", e)))?;

        Ok(NotificationReceipt {
            notification_id: body.notification_id,
            status: body.status,
        })
    }
}

/// Accepts every notification and logs it. Used when no notification service
/// is configured.
#[derive(Default)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, request: NotificationRequest) -> Result<NotificationReceipt> {
        info!(
            tenant_id = %request.tenant_id,
            channel = %request.channel,
            recipient = %request.recipient,
            template_id = %request.template_id,
            subject = %request.subject,
            "Notification accepted (no notification service configured)"
        );
        Ok(NotificationReceipt {
            notification_id: Uuid::new_v4().to_string(),
            status: "logged".to_string(),
        })
    }
}

pub struct HttpWebhookSender {
    client: Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn deliver(&self, request: WebhookRequest) -> Result<u16> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| Error::Rejected(format!("invalid webhook method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_null() {
            builder = builder.json(&request.body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        check_status(&request.url, status)?;

        debug!(url = %request.url, status = status.as_u16(), "Webhook delivered");
        Ok(status.as_u16())
    }
}
