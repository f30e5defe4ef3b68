//! HTTP speech gateway

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;

use crate::config::GatewayConfig;
use crate::conversation::Persona;

use super::{AudioClip, SpeechError, SpeechGateway};

pub struct HttpSpeechGateway {
    client: Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    persona: Persona,
}

impl HttpSpeechGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, SpeechError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.speech_url(),
        })
    }
}

#[async_trait]
impl SpeechGateway for HttpSpeechGateway {
    async fn synthesize(&self, text: &str, persona: Persona) -> Result<AudioClip, SpeechError> {
        let response = self
            .client
            .post(&self.url)
            .json(&SpeechRequest { text, persona })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SpeechError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            // Generic binary labels say nothing about the codec
            .filter(|ct| !ct.starts_with("application/octet-stream"))
            .map(str::to_string);

        let data = response.bytes().await?;
        if data.is_empty() {
            return Err(SpeechError::EmptyAudio);
        }

        let clip = AudioClip::new(data);
        Ok(match content_type {
            Some(ct) => clip.with_content_type(ct),
            None => clip,
        })
    }
}
