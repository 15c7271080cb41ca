//! Authenticated HTTP client for the storefront chat REST API.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::ChatBackend;
use crate::config::Config;
use crate::models::{Chat, ChatStatus, OutgoingMessage, RawMessage};

/// REST client for the chat collaborator endpoints.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.api_url.clone(), config.access_token.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        tracing::debug!("GET {}", url);
        let resp = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let resp = check_response(resp, &url).await?;
        resp.json()
            .await
            .with_context(|| format!("Invalid JSON from {}", url))
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &Value,
    ) -> Result<Value> {
        let url = self.url(path);
        tracing::debug!("{} {}", method, url);
        let resp = self
            .authorize(self.http.request(method.clone(), &url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;
        let resp = check_response(resp, &url).await?;
        resp.json()
            .await
            .with_context(|| format!("Invalid JSON from {}", url))
    }

    async fn post_multipart(&self, path: &str, form: reqwest::multipart::Form) -> Result<Value> {
        let url = self.url(path);
        tracing::debug!("POST {} (multipart)", url);
        let resp = self
            .authorize(self.http.post(&url))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        let resp = check_response(resp, &url).await?;
        resp.json()
            .await
            .with_context(|| format!("Invalid JSON from {}", url))
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn fetch_chat(&self, chat_id: &str) -> Result<Chat> {
        let body = self.get(&format!("/chat/{}", chat_id)).await?;
        unwrap_envelope(body, "chat")
    }

    async fn send_message(&self, chat_id: &str, message: &OutgoingMessage) -> Result<RawMessage> {
        let path = format!("/chat/{}/message", chat_id);
        let body = match &message.attachment {
            Some(attachment) => {
                let file = reqwest::multipart::Part::bytes(attachment.bytes.clone())
                    .file_name(attachment.file_name.clone())
                    .mime_str(&attachment.mime_type)
                    .context("Invalid attachment MIME type")?;
                let mut form = reqwest::multipart::Form::new()
                    .text("chatId", chat_id.to_string())
                    .part("file", file);
                if let Some(content) = &message.content {
                    form = form.text("content", content.clone());
                }
                self.post_multipart(&path, form).await?
            }
            None => {
                let body = serde_json::json!({
                    "chatId": chat_id,
                    "content": message.content,
                });
                self.send_json(reqwest::Method::POST, &path, &body).await?
            }
        };
        unwrap_envelope(body, "message")
    }

    async fn update_status(&self, chat_id: &str, status: ChatStatus) -> Result<ChatStatus> {
        let body = serde_json::json!({ "status": status });
        let body = self
            .send_json(
                reqwest::Method::PATCH,
                &format!("/chat/{}/status", chat_id),
                &body,
            )
            .await?;
        let chat: Chat = unwrap_envelope(body, "chat")?;
        chat.status
            .context("Status update response carries no status")
    }
}

/// Responses are either the bare resource or `{ "<key>": resource, ... }`.
fn unwrap_envelope<T: DeserializeOwned>(body: Value, key: &str) -> Result<T> {
    let inner = match body {
        Value::Object(mut map) if map.get(key).is_some_and(Value::is_object) => {
            map.remove(key).unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(inner).with_context(|| format!("Unexpected {} response shape", key))
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Set access_token in the config file.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_enveloped_chat() {
        let body = json!({
            "success": true,
            "chat": {
                "id": "c1",
                "status": "OPEN",
                "messages": [{ "id": "m1", "senderId": "u1", "createdAt": "2024-05-01T10:00:00Z" }]
            }
        });
        let chat: Chat = unwrap_envelope(body, "chat").unwrap();
        assert_eq!(chat.id, "c1");
        assert_eq!(chat.status, Some(ChatStatus::Open));
        assert_eq!(chat.messages.len(), 1);
    }

    #[test]
    fn test_unwrap_bare_message() {
        let body = json!({ "id": "m1", "senderId": "u1", "content": "hi" });
        let msg: RawMessage = unwrap_envelope(body, "message").unwrap();
        assert_eq!(msg.id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_unwrap_rejects_wrong_shape() {
        assert!(unwrap_envelope::<Chat>(json!({ "chat": "nope" }), "chat").is_err());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = ChatClient::new("http://localhost:5000/api/v1/", None);
        assert_eq!(client.url("/chat/c1"), "http://localhost:5000/api/v1/chat/c1");
    }
}
