//! Provider webhook signature schemes

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use crate::error::{CallEngineError, Result};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// base64(HMAC-SHA1(token, url + concat(sorted(key + value))))
pub fn twilio_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> Result<String> {
    let mac = twilio_mac(auth_token, url, params)?;
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Check an `X-Twilio-Signature` header value in constant time
pub fn verify_twilio_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
    provided: &str,
) -> Result<()> {
    let expected = STANDARD
        .decode(provided.trim())
        .map_err(|_| CallEngineError::invalid_signature("signature is not valid base64"))?;

    twilio_mac(auth_token, url, params)?
        .verify_slice(&expected)
        .map_err(|_| CallEngineError::invalid_signature("telephony signature mismatch"))
}

fn twilio_mac(auth_token: &str, url: &str, params: &[(String, String)]) -> Result<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes())
        .map_err(|e| CallEngineError::internal(format!("Invalid HMAC key: {}", e)))?;

    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    mac.update(url.as_bytes());
    for (key, value) in sorted {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }
    Ok(mac)
}

/// hex(HMAC-SHA256(secret, "<timestamp>.<body>"))
pub fn timestamped_signature(secret: &str, timestamp: i64, body: &[u8]) -> Result<String> {
    let mac = timestamped_mac(secret, timestamp, body)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Header value in the `t=<unix>,v0=<hex>` form
pub fn timestamped_signature_header(secret: &str, timestamp: i64, body: &[u8]) -> Result<String> {
    Ok(format!("t={},v0={}", timestamp, timestamped_signature(secret, timestamp, body)?))
}

/// Check a `t=<unix>,v0=<hex>` signature header and its age
pub fn verify_timestamped_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<()> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| CallEngineError::invalid_signature("malformed signature timestamp"))?,
                );
            }
            Some(("v0", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| CallEngineError::invalid_signature("signature timestamp missing"))?;
    if candidates.is_empty() {
        return Err(CallEngineError::invalid_signature("signature value missing"));
    }

    let age = now.timestamp() - timestamp;
    if age.abs() > max_age.num_seconds() {
        return Err(CallEngineError::invalid_signature(format!(
            "signature timestamp outside tolerance ({}s)",
            age
        )));
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        if timestamped_mac(secret, timestamp, body)?.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(CallEngineError::invalid_signature("voice signature mismatch"))
}

fn timestamped_mac(secret: &str, timestamp: i64, body: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CallEngineError::internal(format!("Invalid HMAC key: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}
