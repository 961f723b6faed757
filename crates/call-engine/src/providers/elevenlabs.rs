//! ElevenLabs-compatible text-to-speech client

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::script::render_confirmation_script;
use super::{ConversationRequest, PreparedConversation, VoiceClient};
use crate::config::VoiceConfig;
use crate::error::{CallEngineError, Result, VoiceError};

const DEFAULT_CONTENT_TYPE: &str = "audio/mpeg";

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.5,
            style: 0.0,
            use_speaker_boost: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Clone, Debug)]
pub struct ElevenLabsVoiceClient {
    http: reqwest::Client,
    config: VoiceConfig,
}

impl ElevenLabsVoiceClient {
    pub fn new(config: VoiceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CallEngineError::config(format!("Failed to build voice HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn speech_url(&self, voice_id: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{}",
            self.config.api_base_url.trim_end_matches('/'),
            voice_id
        )
    }
}

#[async_trait]
impl VoiceClient for ElevenLabsVoiceClient {
    async fn prepare(&self, request: &ConversationRequest) -> std::result::Result<PreparedConversation, VoiceError> {
        let script = render_confirmation_script(
            &request.customer_name,
            &request.external_order_id,
            request.total_amount,
            &request.currency,
            &request.items,
            &request.language,
        );

        let body = SpeechRequest {
            text: &script,
            model_id: &self.config.model_id,
            voice_settings: VoiceSettings::default(),
        };

        let response = self
            .http
            .post(self.speech_url(&request.voice_id))
            .header("xi-api-key", &self.config.api_key)
            .header(reqwest::header::ACCEPT, DEFAULT_CONTENT_TYPE)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Unavailable(format!("speech request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), voice_id = %request.voice_id, "🔇 Speech synthesis failed");
            return Err(if status.is_client_error() && status.as_u16() != 429 {
                VoiceError::Rejected(format!("HTTP {}: {}", status.as_u16(), detail))
            } else {
                VoiceError::Unavailable(format!("HTTP {}: {}", status.as_u16(), detail))
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let audio = response
            .bytes()
            .await
            .map_err(|e| VoiceError::Unavailable(format!("speech body unreadable: {}", e)))?;

        debug!(bytes = audio.len(), voice_id = %request.voice_id, language = %request.language, "Conversation audio ready");
        Ok(PreparedConversation {
            script,
            audio,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ElevenLabsVoiceClient {
        ElevenLabsVoiceClient::new(VoiceConfig {
            api_base_url: server.uri(),
            api_key: "xi-key".to_string(),
            ..VoiceConfig::default()
        })
        .unwrap()
    }

    fn request() -> ConversationRequest {
        ConversationRequest {
            customer_name: "Lucía".to_string(),
            external_order_id: "2002".to_string(),
            total_amount: 15.0,
            currency: "EUR".to_string(),
            items: Vec::new(),
            language: "es".to_string(),
            voice_id: "voice-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_prepare_synthesises_localised_script() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/voice-1"))
            .and(header("xi-api-key", "xi-key"))
            .and(body_partial_json(serde_json::json!({
                "model_id": "eleven_monolingual_v1",
                "voice_settings": { "use_speaker_boost": true }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/mpeg")
                    .set_body_bytes(vec![0xFF, 0xFB, 0x90]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let prepared = client(&server).prepare(&request()).await.unwrap();
        assert!(prepared.script.starts_with("Hola Lucía"));
        assert_eq!(prepared.audio.as_ref(), &[0xFF, 0xFB, 0x90]);
        assert_eq!(prepared.content_type, "audio/mpeg");
    }

    #[tokio::test]
    async fn test_prepare_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(matches!(client.prepare(&request()).await, Err(VoiceError::Rejected(_))));
        assert!(matches!(client.prepare(&request()).await, Err(VoiceError::Unavailable(_))));
    }
}
