//! Twilio-compatible Calls API client

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{DialRequest, TelephonyClient};
use crate::config::TelephonyConfig;
use crate::error::{CallEngineError, DialError, Result};
use crate::types::ProviderCallId;
use crate::webhook::mapping::INVALID_NUMBER_ERROR_CODES;

/// Provider code for "too many requests"
const RATE_LIMIT_ERROR_CODE: i64 = 20429;

const STATUS_CALLBACK_EVENTS: &str = "initiated ringing answered completed";

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TwilioTelephonyClient {
    http: reqwest::Client,
    config: TelephonyConfig,
}

impl TwilioTelephonyClient {
    pub fn new(config: TelephonyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CallEngineError::config(format!("Failed to build telephony HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    fn call_url(&self, sid: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.account_sid,
            sid
        )
    }
}

/// Classify a failed API response
fn classify_error(status: StatusCode, body: &str) -> DialError {
    let error: ApiError = serde_json::from_str(body).unwrap_or_default();
    let detail = error
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    if status == StatusCode::TOO_MANY_REQUESTS || error.code == Some(RATE_LIMIT_ERROR_CODE) {
        return DialError::RateLimited(detail);
    }

    if let Some(code) = error.code {
        if INVALID_NUMBER_ERROR_CODES.contains(&code.to_string().as_str()) {
            return DialError::InvalidNumber(format!("{} ({})", detail, code));
        }
    }

    DialError::ProviderError(detail)
}

#[async_trait]
impl TelephonyClient for TwilioTelephonyClient {
    async fn dial(&self, request: &DialRequest) -> std::result::Result<ProviderCallId, DialError> {
        let form = [
            ("To", request.to.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Url", request.answer_url.as_str()),
            ("StatusCallback", request.callback_url.as_str()),
            ("StatusCallbackEvent", STATUS_CALLBACK_EVENTS),
            ("StatusCallbackMethod", "POST"),
        ];

        let response = self
            .http
            .post(self.calls_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| DialError::ProviderError(format!("telephony request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DialError::ProviderError(format!("telephony response unreadable: {}", e)))?;

        if !status.is_success() {
            let error = classify_error(status, &body);
            warn!(status = status.as_u16(), "📵 Dial rejected: {}", error);
            return Err(error);
        }

        let call: CallResource = serde_json::from_str(&body)
            .map_err(|e| DialError::ProviderError(format!("unexpected telephony response: {}", e)))?;

        info!(provider_call_id = %call.sid, "📞 Outbound call submitted");
        Ok(ProviderCallId::new(call.sid))
    }

    async fn terminate(&self, provider_call_id: &ProviderCallId) -> std::result::Result<(), DialError> {
        let response = self
            .http
            .post(self.call_url(provider_call_id.as_str()))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(|e| DialError::ProviderError(format!("terminate request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status, &body));
        }

        debug!(provider_call_id = %provider_call_id, "Call termination requested");
        Ok(())
    }
}
