//! Provider payloads to session events
//!
//! Both mappings are closed: a status or disposition outside the known set is
//! an `UnsupportedEvent` error, never silently ignored.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{CallEngineError, Result};
use crate::session::SessionEvent;
use crate::types::{CallArtifacts, ProviderCallId};

pub use crate::types::WebhookSource;

/// Telephony error codes that mean the destination number is unusable
pub const INVALID_NUMBER_ERROR_CODES: [&str; 7] = ["21211", "21214", "21215", "21217", "21401", "21407", "13224"];

/// SIP final responses that mean the destination does not exist
const INVALID_NUMBER_SIP_CODES: [&str; 3] = ["404", "484", "604"];

/// A provider callback reduced to what the session needs
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub source: WebhookSource,
    pub provider_call_id: ProviderCallId,
    pub event: SessionEvent,
    pub sequence: i64,
    pub payload_hash: String,
    pub received_at: DateTime<Utc>,
    pub artifacts: CallArtifacts,
}

/// sha256 of the raw body, hex encoded
pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Sequence for providers that do not number their callbacks:
/// event time in milliseconds, with the event's rank in the low bits so that
/// callbacks sharing a timestamp still order by call progress.
pub fn derived_sequence(at: DateTime<Utc>, event: &SessionEvent) -> i64 {
    at.timestamp_millis().saturating_mul(16).saturating_add(event_rank(event))
}

fn event_rank(event: &SessionEvent) -> i64 {
    match event {
        SessionEvent::Initiated => 0,
        SessionEvent::Ringing => 1,
        SessionEvent::Answered => 2,
        SessionEvent::Busy => 3,
        SessionEvent::NoAnswer => 4,
        SessionEvent::InvalidNumber => 5,
        SessionEvent::ProviderError => 6,
        SessionEvent::Canceled => 7,
        SessionEvent::HangupNoDisposition => 8,
        SessionEvent::VoiceTimeout => 9,
        SessionEvent::VoiceDeclined => 10,
        SessionEvent::VoiceConfirmed => 11,
        _ => 15,
    }
}

/// Map a telephony `CallStatus` (plus error details) to an event
pub fn telephony_status_event(
    status: &str,
    error_code: Option<&str>,
    sip_response_code: Option<&str>,
) -> Result<SessionEvent> {
    let event = match status {
        "queued" | "initiated" => SessionEvent::Initiated,
        "ringing" => SessionEvent::Ringing,
        "in-progress" | "answered" => SessionEvent::Answered,
        "busy" => SessionEvent::Busy,
        "no-answer" => SessionEvent::NoAnswer,
        "completed" => SessionEvent::HangupNoDisposition,
        "canceled" => SessionEvent::Canceled,
        "failed" => {
            let invalid_code = error_code.is_some_and(|c| INVALID_NUMBER_ERROR_CODES.contains(&c));
            let invalid_sip = sip_response_code.is_some_and(|c| INVALID_NUMBER_SIP_CODES.contains(&c));
            if invalid_code || invalid_sip {
                SessionEvent::InvalidNumber
            } else {
                SessionEvent::ProviderError
            }
        }
        other => {
            return Err(CallEngineError::unsupported_event(format!(
                "unknown telephony call status '{}'",
                other
            )));
        }
    };
    Ok(event)
}

fn field<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
        .filter(|value| !value.is_empty())
}

/// Map a form-encoded telephony status callback
pub fn map_telephony(params: &[(String, String)], body: &[u8], received_at: DateTime<Utc>) -> Result<NormalizedEvent> {
    let call_sid = field(params, "CallSid").ok_or_else(|| CallEngineError::validation("CallSid is required"))?;
    let status = field(params, "CallStatus").ok_or_else(|| CallEngineError::validation("CallStatus is required"))?;

    let event = telephony_status_event(status, field(params, "ErrorCode"), field(params, "SipResponseCode"))?;

    let sequence = match field(params, "SequenceNumber") {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| CallEngineError::validation(format!("Invalid SequenceNumber '{}'", raw)))?,
        None => {
            let at = field(params, "Timestamp")
                .and_then(|ts| DateTime::parse_from_rfc2822(ts).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(received_at);
            derived_sequence(at, &event)
        }
    };

    let duration_secs = match field(params, "CallDuration") {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| CallEngineError::validation(format!("Invalid CallDuration '{}'", raw)))?,
        ),
        None => None,
    };

    Ok(NormalizedEvent {
        source: WebhookSource::Telephony,
        provider_call_id: ProviderCallId::new(call_sid),
        event,
        sequence,
        payload_hash: payload_hash(body),
        received_at,
        artifacts: CallArtifacts {
            transcript: None,
            recording_url: field(params, "RecordingUrl").map(str::to_string),
            duration_secs,
        },
    })
}

/// JSON body of a voice provider disposition callback
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceDispositionPayload {
    pub call_sid: String,
    pub disposition: String,
    /// Unix seconds
    pub event_timestamp: i64,
    #[serde(default)]
    pub sequence: Option<i64>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub recording_url: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<i64>,
}

pub fn voice_disposition_event(disposition: &str) -> Result<SessionEvent> {
    match disposition {
        "confirmed" => Ok(SessionEvent::VoiceConfirmed),
        "declined" => Ok(SessionEvent::VoiceDeclined),
        "timeout" => Ok(SessionEvent::VoiceTimeout),
        other => Err(CallEngineError::unsupported_event(format!(
            "unknown voice disposition '{}'",
            other
        ))),
    }
}

/// Map a JSON voice disposition callback
pub fn map_voice(body: &[u8], received_at: DateTime<Utc>) -> Result<NormalizedEvent> {
    let payload: VoiceDispositionPayload = serde_json::from_slice(body)
        .map_err(|e| CallEngineError::validation(format!("Malformed voice webhook: {}", e)))?;

    if payload.call_sid.trim().is_empty() {
        return Err(CallEngineError::validation("call_sid is required"));
    }

    let event = voice_disposition_event(&payload.disposition)?;
    let sequence = match payload.sequence {
        Some(sequence) => sequence,
        None => {
            let at = Utc
                .timestamp_opt(payload.event_timestamp, 0)
                .single()
                .ok_or_else(|| CallEngineError::validation("event_timestamp out of range"))?;
            derived_sequence(at, &event)
        }
    };

    Ok(NormalizedEvent {
        source: WebhookSource::Voice,
        provider_call_id: ProviderCallId::new(payload.call_sid),
        event,
        sequence,
        payload_hash: payload_hash(body),
        received_at,
        artifacts: CallArtifacts {
            transcript: payload.transcript,
            recording_url: payload.recording_url,
            duration_secs: payload.duration_secs,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_telephony_status_mapping_is_closed() {
        assert_eq!(telephony_status_event("ringing", None, None).unwrap(), SessionEvent::Ringing);
        assert_eq!(telephony_status_event("in-progress", None, None).unwrap(), SessionEvent::Answered);
        assert_eq!(telephony_status_event("no-answer", None, None).unwrap(), SessionEvent::NoAnswer);
        assert_eq!(
            telephony_status_event("completed", None, None).unwrap(),
            SessionEvent::HangupNoDisposition
        );
        assert_eq!(
            telephony_status_event("failed", Some("21211"), None).unwrap(),
            SessionEvent::InvalidNumber
        );
        assert_eq!(
            telephony_status_event("failed", None, Some("404")).unwrap(),
            SessionEvent::InvalidNumber
        );
        assert_eq!(
            telephony_status_event("failed", Some("31005"), None).unwrap(),
            SessionEvent::ProviderError
        );
        assert!(matches!(
            telephony_status_event("transferred", None, None),
            Err(CallEngineError::UnsupportedEvent(_))
        ));
    }

    #[test]
    fn test_map_telephony_reads_sequence_and_artifacts() {
        let params = form(&[
            ("CallSid", "CA42"),
            ("CallStatus", "completed"),
            ("SequenceNumber", "3"),
            ("CallDuration", "47"),
            ("RecordingUrl", "https://rec.example/CA42"),
        ]);
        let event = map_telephony(&params, b"raw", Utc::now()).unwrap();
        assert_eq!(event.provider_call_id, ProviderCallId::new("CA42"));
        assert_eq!(event.sequence, 3);
        assert_eq!(event.artifacts.duration_secs, Some(47));
        assert_eq!(event.payload_hash, payload_hash(b"raw"));

        assert!(matches!(
            map_telephony(&form(&[("CallStatus", "ringing")]), b"", Utc::now()),
            Err(CallEngineError::Validation(_))
        ));
    }

    #[test]
    fn test_derived_sequence_orders_same_second_events_by_progress() {
        let params = |status: &str| {
            form(&[
                ("CallSid", "CA1"),
                ("CallStatus", status),
                ("Timestamp", "Mon, 16 Aug 2010 03:45:01 +0000"),
            ])
        };
        let ringing = map_telephony(&params("ringing"), b"", Utc::now()).unwrap();
        let answered = map_telephony(&params("in-progress"), b"", Utc::now()).unwrap();
        assert!(answered.sequence > ringing.sequence);
    }

    #[test]
    fn test_map_voice_disposition() {
        let body = br#"{"call_sid":"CA9","disposition":"confirmed","event_timestamp":1700000000,"sequence":5,"transcript":"yes please"}"#;
        let event = map_voice(body, Utc::now()).unwrap();
        assert_eq!(event.event, SessionEvent::VoiceConfirmed);
        assert_eq!(event.sequence, 5);
        assert_eq!(event.artifacts.transcript.as_deref(), Some("yes please"));

        let body = br#"{"call_sid":"CA9","disposition":"declined","event_timestamp":1700000000}"#;
        let event = map_voice(body, Utc::now()).unwrap();
        assert_eq!(event.sequence, 1_700_000_000_000 * 16 + 10);

        let body = br#"{"call_sid":"CA9","disposition":"maybe","event_timestamp":1700000000}"#;
        assert!(matches!(map_voice(body, Utc::now()), Err(CallEngineError::UnsupportedEvent(_))));
        assert!(matches!(map_voice(b"not json", Utc::now()), Err(CallEngineError::Validation(_))));
    }
}
