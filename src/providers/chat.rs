//! HTTP chat gateway

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;
use crate::conversation::Persona;

use super::{ChatGateway, GatewayError};

pub struct HttpChatGateway {
    client: Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    persona: Persona,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpChatGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.chat_url(),
        })
    }
}

#[async_trait]
impl ChatGateway for HttpChatGateway {
    async fn reply(&self, message: &str, persona: Persona) -> Result<String, GatewayError> {
        tracing::debug!(url = %self.url, %persona, "Sending chat request");

        let response = self
            .client
            .post(&self.url)
            .json(&ChatRequest { message, persona })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            // Prefer the gateway's own error text when it sent one
            let message = serde_json::from_str::<ChatReply>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(body);
            return Err(GatewayError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let reply: ChatReply = serde_json::from_str(&body).map_err(|e| {
            GatewayError::InvalidResponse(format!("Failed to parse response: {} - Body: {}", e, body))
        })?;

        if let Some(error) = reply.error {
            return Err(GatewayError::Remote(error));
        }

        reply
            .response
            .ok_or_else(|| GatewayError::InvalidResponse("No response received from server".to_string()))
    }
}
