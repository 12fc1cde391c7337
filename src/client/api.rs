//! REST collaborator used by the reconciler.
//!
//! The trait is the seam for tests: the reconciler only ever sees
//! `Arc<dyn DeliveryApi>`, and [`HttpApi`] is the production implementation
//! against the relay's `/api` routes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;

use super::config::ClientConfig;
use super::error::ClientError;
use crate::wire::{ConversationSummary, Message, Notification, SendMessageRequest};

#[async_trait]
pub trait DeliveryApi: Send + Sync {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError>;

    async fn fetch_history(&self, counterpart_id: &str) -> Result<Vec<Message>, ClientError>;

    /// Persist a message. The returned value carries the server id and timestamp.
    async fn send_message(&self, receiver_id: &str, content: &str) -> Result<Message, ClientError>;

    async fn mark_conversation_read(&self, counterpart_id: &str) -> Result<(), ClientError>;

    async fn fetch_notifications(&self) -> Result<Vec<Notification>, ClientError>;

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), ClientError>;

    async fn mark_all_notifications_read(&self) -> Result<(), ClientError>;
}

const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Bearer-authenticated client for the relay REST API.
#[derive(Clone)]
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
    attempts: u32,
}

impl HttpApi {
    pub fn new(config: &ClientConfig, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.rest_base(),
            token: token.into(),
            attempts: config.request_attempts.max(1),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send_once(
        &self,
        builder: RequestBuilder,
        method: &'static str,
        path: &str,
    ) -> Result<reqwest::Response, ClientError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                method,
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    /// GET with exponential-delay retry on transport failures and 5xx responses.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let mut attempt = 1;
        loop {
            let result = match self.send_once(self.request(Method::GET, path), "GET", path).await {
                Ok(response) => response.json::<T>().await.map_err(ClientError::from),
                Err(e) => Err(e),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::debug!(path, attempt, error = %e, "Retrying GET");
                    tokio::time::sleep(RETRY_DELAY * 2u32.saturating_pow(attempt - 1)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn put(&self, path: &str) -> Result<(), ClientError> {
        self.send_once(self.request(Method::PUT, path), "PUT", path)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl DeliveryApi for HttpApi {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        self.get_json("/api/messages/conversations").await
    }

    async fn fetch_history(&self, counterpart_id: &str) -> Result<Vec<Message>, ClientError> {
        self.get_json(&format!("/api/messages/{counterpart_id}")).await
    }

    async fn send_message(&self, receiver_id: &str, content: &str) -> Result<Message, ClientError> {
        let path = "/api/messages";
        let body = SendMessageRequest {
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
        };
        let response = self
            .send_once(self.request(Method::POST, path).json(&body), "POST", path)
            .await?;
        Ok(response.json::<Message>().await?)
    }

    async fn mark_conversation_read(&self, counterpart_id: &str) -> Result<(), ClientError> {
        self.put(&format!("/api/messages/read/{counterpart_id}")).await
    }

    async fn fetch_notifications(&self) -> Result<Vec<Notification>, ClientError> {
        self.get_json("/api/notifications").await
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), ClientError> {
        self.put(&format!("/api/notifications/{notification_id}/read")).await
    }

    async fn mark_all_notifications_read(&self) -> Result<(), ClientError> {
        self.put("/api/notifications/read-all").await
    }
}
