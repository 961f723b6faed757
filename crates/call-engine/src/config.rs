use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CallEngineError, Result};
use crate::retry::RetryPolicy;

/// Call engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CallEngineConfig {
    /// Instance identity and public addressing
    pub general: GeneralConfig,

    /// Durable storage
    pub database: DatabaseConfig,

    /// Order lease settings
    pub gate: GateConfig,

    /// Retry policy and dispatcher
    pub retry: RetryConfig,

    /// Inbound webhook verification and deduplication
    pub webhook: WebhookConfig,

    /// Stuck-call ceiling
    pub timeouts: TimeoutConfig,

    /// Telephony provider binding
    pub telephony: TelephonyConfig,

    /// Voice provider binding
    pub voice: VoiceConfig,
}

/// General engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Lease owner id for this process
    pub instance_id: String,

    /// Externally reachable base URL, used for provider callbacks and signature checks
    pub public_base_url: String,

    /// HTTP listen address
    pub bind_address: String,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL
    pub url: String,

    pub max_connections: u32,
}

/// Lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Lease lifetime without renewal
    pub lease_ttl_secs: u64,

    /// How often this instance renews the leases it owns
    pub renew_interval_secs: u64,

    /// How often expired leases are reclaimed
    pub sweep_interval_secs: u64,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: u64,
    /// Retry eligibility ends this long after the first attempt
    pub total_window_secs: u64,
    /// How often due retries are dispatched
    pub dispatch_interval_secs: u64,
}

/// Webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Telephony signing token; falls back to `telephony.auth_token` when empty
    pub telephony_auth_token: String,

    /// Shared secret for voice provider webhooks
    pub voice_webhook_secret: String,

    /// How long delivered events are remembered for deduplication
    pub redelivery_window_secs: u64,

    /// Maximum age of a timestamped signature
    pub max_signature_age_secs: u64,
}

/// Timeout sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// A Dialing/InProgress attempt with no event for this long is failed
    pub call_ceiling_secs: u64,

    pub sweep_interval_secs: u64,
}

/// Telephony provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    pub api_base_url: String,
    pub account_sid: String,
    pub auth_token: String,
    /// Caller id presented to customers
    pub from_number: String,
    pub request_timeout_secs: u64,
}

/// Voice provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub api_base_url: String,
    pub api_key: String,
    /// Used when neither the request nor the order names a voice
    pub default_voice_id: String,
    pub model_id: String,
    pub default_language: String,
    pub request_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("engine-{}", uuid::Uuid::new_v4()),
            public_base_url: "http://localhost:8080".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://voiceconfirm.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 120,
            renew_interval_secs: 30,
            sweep_interval_secs: 15,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_secs: 300,
            backoff_multiplier: 2.0,
            max_backoff_secs: 3600,
            total_window_secs: 86_400,
            dispatch_interval_secs: 10,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            telephony_auth_token: String::new(),
            voice_webhook_secret: String::new(),
            redelivery_window_secs: 3600,
            max_signature_age_secs: 300,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_ceiling_secs: 600,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.twilio.com".to_string(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            request_timeout_secs: 15,
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.elevenlabs.io".to_string(),
            api_key: String::new(),
            default_voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            model_id: "eleven_monolingual_v1".to_string(),
            default_language: "en".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: chrono::Duration::seconds(self.base_backoff_secs as i64),
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: chrono::Duration::seconds(self.max_backoff_secs as i64),
            total_window: chrono::Duration::seconds(self.total_window_secs as i64),
        }
    }
}

impl GateConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs as i64)
    }
}

impl WebhookConfig {
    pub fn redelivery_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.redelivery_window_secs as i64)
    }
}

impl TimeoutConfig {
    pub fn call_ceiling(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.call_ceiling_secs as i64)
    }
}

impl TelephonyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl CallEngineConfig {
    /// Load configuration from defaults, an optional file, and `VOICECONFIRM__*` environment variables.
    ///
    /// Environment keys use `__` between sections, e.g. `VOICECONFIRM__GATE__LEASE_TTL_SECS=60`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&CallEngineConfig::default())
            .map_err(|e| CallEngineError::config(format!("Failed to build defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("VOICECONFIRM")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: CallEngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CallEngineError::config(e.to_string()))?;

        loaded.validate().map_err(CallEngineError::config)?;
        Ok(loaded)
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.general.instance_id.trim().is_empty() {
            return Err("instance_id cannot be empty".to_string());
        }

        if url::Url::parse(&self.general.public_base_url).is_err() {
            return Err(format!("Invalid public_base_url: {}", self.general.public_base_url));
        }

        if self.database.url.is_empty() {
            return Err("database url cannot be empty".to_string());
        }

        if self.database.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }

        if self.gate.lease_ttl_secs == 0 {
            return Err("lease_ttl_secs must be greater than 0".to_string());
        }

        if self.gate.renew_interval_secs >= self.gate.lease_ttl_secs {
            return Err("renew_interval_secs must be less than lease_ttl_secs".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be at least 1.0".to_string());
        }

        if self.retry.max_backoff_secs < self.retry.base_backoff_secs {
            return Err("max_backoff_secs must not be less than base_backoff_secs".to_string());
        }

        if self.timeouts.call_ceiling_secs == 0 {
            return Err("call_ceiling_secs must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Token used to verify telephony webhook signatures
    pub fn telephony_signing_token(&self) -> &str {
        if self.webhook.telephony_auth_token.is_empty() {
            &self.telephony.auth_token
        } else {
            &self.webhook.telephony_auth_token
        }
    }

    /// Configuration for tests: in-memory database, short intervals
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.general.instance_id = "engine-test".to_string();
        config.general.public_base_url = "https://engine.test".to_string();
        config.database.url = "sqlite::memory:".to_string();
        config.database.max_connections = 1;
        config.webhook.telephony_auth_token = "test-telephony-token".to_string();
        config.webhook.voice_webhook_secret = "test-voice-secret".to_string();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CallEngineConfig::default().validate().is_ok());
        assert!(CallEngineConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = CallEngineConfig::default();
        config.gate.renew_interval_secs = config.gate.lease_ttl_secs;
        assert!(config.validate().is_err());

        let mut config = CallEngineConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = CallEngineConfig::default();
        config.general.public_base_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = CallEngineConfig::default();
        config.retry.max_backoff_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_layers_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[general]\ninstance_id = \"engine-a\"\n\n[retry]\nmax_attempts = 5\n"
        )
        .unwrap();

        let config = CallEngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.general.instance_id, "engine-a");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_backoff_secs, 300);
        assert_eq!(config.voice.default_voice_id, "21m00Tcm4TlvDq8ikWAM");
    }

    #[test]
    fn test_signing_token_falls_back_to_auth_token() {
        let mut config = CallEngineConfig::default();
        config.telephony.auth_token = "auth".to_string();
        assert_eq!(config.telephony_signing_token(), "auth");
        config.webhook.telephony_auth_token = "hook".to_string();
        assert_eq!(config.telephony_signing_token(), "hook");
    }
}
