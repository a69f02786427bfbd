//! HTTP endpoints, and a cache-aware wrapper over them.

use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use vigil_shared::constants::DEFAULT_PAGE_SIZE;
use vigil_shared::types::{
    ConversationSummary, Message, MessageId, MessageType, PresenceEntry, UserId,
};

use crate::cache::{self, MessageCache, SharedCache};
use crate::config::ClientConfig;
use crate::error::ClientError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    receiver_id: UserId,
    content: &'a str,
    #[serde(rename = "type")]
    message_type: MessageType,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest<'a> {
    message_ids: &'a [MessageId],
}

/// Result of a read-marking call: the messages that actually flipped.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    pub updated: usize,
    pub message_ids: Vec<MessageId>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base: config.http_base().to_string(),
            token: config.session_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response.json().await?)
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        self.send(self.http.get(self.url("/conversations"))).await
    }

    /// One page of the thread with `other`, oldest first.
    pub async fn messages(
        &self,
        other: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, ClientError> {
        let request = self
            .http
            .get(self.url(&format!("/messages/{other}")))
            .query(&[("limit", limit), ("offset", offset)]);
        self.send(request).await
    }

    pub async fn send_message(
        &self,
        receiver: UserId,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message, ClientError> {
        let body = SendMessageRequest {
            receiver_id: receiver,
            content,
            message_type,
        };
        self.send(self.http.post(self.url("/messages")).json(&body))
            .await
    }

    pub async fn mark_as_read(&self, ids: &[MessageId]) -> Result<MarkReadResponse, ClientError> {
        let body = MarkReadRequest { message_ids: ids };
        self.send(self.http.patch(self.url("/messages/read")).json(&body))
            .await
    }

    pub async fn mark_all_as_read(&self, sender: UserId) -> Result<MarkReadResponse, ClientError> {
        self.send(self.http.patch(self.url(&format!("/messages/read-all/{sender}"))))
            .await
    }

    pub async fn online_users(&self) -> Result<Vec<UserId>, ClientError> {
        self.send(self.http.get(self.url("/online-users"))).await
    }

    pub async fn user_status(&self, user: UserId) -> Result<PresenceEntry, ClientError> {
        self.send(self.http.get(self.url(&format!("/user-status/{user}"))))
            .await
    }
}

fn status_error(status: StatusCode, body: &str) -> ClientError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string());
    ClientError::Status {
        status: status.as_u16(),
        message,
    }
}

/// [`ApiClient`] plus the local cache. Successful writes invalidate or patch
/// the cached threads; failed ones leave the cache untouched.
#[derive(Clone)]
pub struct Messenger {
    api: ApiClient,
    cache: SharedCache,
}

impl Messenger {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            api: ApiClient::new(config)?,
            cache: MessageCache::shared(config.user_id),
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Shared with the socket driver so pushes and receipts land here too.
    pub fn cache(&self) -> SharedCache {
        self.cache.clone()
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        let cached = cache::lock(&self.cache).summaries().map(<[_]>::to_vec);
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let summaries = self.api.conversations().await?;
        cache::lock(&self.cache).store_summaries(summaries.clone());
        Ok(summaries)
    }

    /// The most recent page of the thread with `other`.
    pub async fn conversation(&self, other: UserId) -> Result<Vec<Message>, ClientError> {
        let cached = cache::lock(&self.cache).conversation(other).map(<[_]>::to_vec);
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let messages = self.api.messages(other, DEFAULT_PAGE_SIZE, 0).await?;
        cache::lock(&self.cache).store_conversation(other, messages.clone());
        Ok(messages)
    }

    pub async fn send_message(
        &self,
        receiver: UserId,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message, ClientError> {
        let message = self.api.send_message(receiver, content, message_type).await?;
        debug!(id = %message.id, receiver = %receiver, "Message sent");
        cache::lock(&self.cache).invalidate_conversation(receiver);
        Ok(message)
    }

    pub async fn mark_as_read(&self, ids: &[MessageId]) -> Result<MarkReadResponse, ClientError> {
        let response = self.api.mark_as_read(ids).await?;
        cache::lock(&self.cache).apply_read(&response.message_ids);
        Ok(response)
    }

    pub async fn mark_all_as_read(&self, sender: UserId) -> Result<MarkReadResponse, ClientError> {
        let response = self.api.mark_all_as_read(sender).await?;
        cache::lock(&self.cache).apply_all_read_from(sender);
        Ok(response)
    }
}
