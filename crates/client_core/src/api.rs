use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use shared::{
    domain::ChatScope,
    error::ApiError,
    protocol::{HistoryResponse, MessageRecord, SendMessageRequest, SendMessageResponse},
};

use crate::error::{ChatError, ChatResult};

/// Persistence and history surface of the chat server.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One page of history starting `offset` messages back from the newest.
    async fn fetch_page(&self, scope: ChatScope, offset: usize) -> ChatResult<Vec<MessageRecord>>;
    async fn send_message(&self, request: SendMessageRequest) -> ChatResult<MessageRecord>;
}

pub struct HttpChatApi {
    http: Client,
    server_url: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ApiError>,
}

impl HttpChatApi {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self { http, server_url }
    }

    fn messages_url(&self, scope: ChatScope) -> String {
        format!(
            "{}/chat/{}/{}/messages",
            self.server_url, scope.chat_type, scope.chat_id
        )
    }
}

#[async_trait]
impl ChatBackend for HttpChatApi {
    async fn fetch_page(&self, scope: ChatScope, offset: usize) -> ChatResult<Vec<MessageRecord>> {
        let response = self
            .http
            .get(self.messages_url(scope))
            .query(&[("offset", offset)])
            .send()
            .await?;
        let body: HistoryResponse = decode(response).await?;
        if !body.success {
            return Err(rejection(body.error));
        }
        Ok(body.messages)
    }

    async fn send_message(&self, request: SendMessageRequest) -> ChatResult<MessageRecord> {
        let response = self
            .http
            .post(self.messages_url(request.scope))
            .json(&request)
            .send()
            .await?;
        let body: SendMessageResponse = decode(response).await?;
        match body {
            SendMessageResponse {
                success: true,
                message: Some(message),
                ..
            } => Ok(message),
            SendMessageResponse { success: true, .. } => Err(ChatError::Validation(
                "server accepted the message without returning it".to_string(),
            )),
            SendMessageResponse { error, .. } => Err(rejection(error)),
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ChatResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| ChatError::Transport(format!("invalid response body: {err}")));
    }

    let text = response.text().await.unwrap_or_default();
    let api_error = serde_json::from_str::<ApiError>(&text).ok().or_else(|| {
        serde_json::from_str::<ErrorEnvelope>(&text)
            .ok()
            .and_then(|envelope| envelope.error)
    });
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || api_error
            .as_ref()
            .map(|err| err.code.is_retryable())
            .unwrap_or(false);
    let message = api_error
        .map(|err| err.message)
        .unwrap_or_else(|| format!("http status {status}"));

    if retryable {
        Err(ChatError::Transport(message))
    } else {
        Err(ChatError::Validation(message))
    }
}

fn rejection(error: Option<ApiError>) -> ChatError {
    match error {
        Some(err) if err.code.is_retryable() => ChatError::Transport(err.message),
        Some(err) => ChatError::Validation(err.message),
        None => ChatError::Validation("request rejected".to_string()),
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
