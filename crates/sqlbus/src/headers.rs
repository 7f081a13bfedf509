//! Transport message shape and the reserved `rbs2-*` headers.
//!
//! Headers are carried as a string map and persisted as UTF-8 JSON; queue
//! tables treat the encoded bytes as opaque. A handful of reserved keys
//! change how the send path files a message: priority, deferral, TTL and
//! the optional ordering key.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::BusError;

/// Unique message id, set by the bus runtime.
pub const HEADER_MESSAGE_ID: &str = "rbs2-msg-id";
/// Integer delivery priority; higher is delivered first. Default 0.
pub const HEADER_PRIORITY: &str = "rbs2-msg-priority";
/// ISO-8601 instant before which the message must not be delivered.
/// Stripped before the header map is serialized.
pub const HEADER_DEFERRED_UNTIL: &str = "rbs2-deferred-until";
/// Real destination of a message sent to the timeout-manager sentinel.
pub const HEADER_DEFERRED_RECIPIENT: &str = "rbs2-deferred-recipient";
/// Time-to-be-received duration (`[d.]hh:mm:ss[.frac]` or plain seconds).
pub const HEADER_TIME_TO_BE_RECEIVED: &str = "rbs2-time-to-be-received";
/// Ordering key: messages sharing a key are delivered strictly serially.
pub const HEADER_ORDERING_KEY: &str = "rbs2-ordering-key";

/// Sentinel destination that reroutes a deferred message to the recipient
/// named in [`HEADER_DEFERRED_RECIPIENT`]. Compared case-insensitively.
pub const TIMEOUT_MANAGER_ADDRESS: &str = "##### MagicExternalTimeoutManagerAddress #####";

/// TTL applied when [`HEADER_TIME_TO_BE_RECEIVED`] is absent.
pub const DEFAULT_TIME_TO_BE_RECEIVED: Duration = Duration::from_secs(i32::MAX as u64);

/// A message as the transport sees it: an opaque body plus a header map.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransportMessage {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// The bus-assigned message id, when present.
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(HEADER_MESSAGE_ID).map(String::as_str)
    }
}

/// Encode a header map into the persisted byte form.
pub fn serialize_headers(headers: &HashMap<String, String>) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(headers).map_err(|e| BusError::MalformedMessage {
        reason: format!("failed to serialize headers: {e}"),
        source: Some(Box::new(e)),
    })
}

/// Decode the persisted byte form back into a header map.
pub fn deserialize_headers(bytes: &[u8]) -> Result<HashMap<String, String>, BusError> {
    serde_json::from_slice(bytes).map_err(|e| BusError::MalformedMessage {
        reason: format!("failed to deserialize headers: {e}"),
        source: Some(Box::new(e)),
    })
}

/// Delivery priority from [`HEADER_PRIORITY`]. Absent ⇒ 0; a header that is
/// present but not an integer is a fatal malformed message.
pub fn priority(headers: &HashMap<String, String>) -> Result<i32, BusError> {
    match headers.get(HEADER_PRIORITY) {
        None => Ok(0),
        Some(raw) => raw.trim().parse().map_err(|e| BusError::MalformedMessage {
            reason: format!("'{HEADER_PRIORITY}' header value '{raw}' is not an integer"),
            source: Some(Box::new(e)),
        }),
    }
}

/// Remove and parse [`HEADER_DEFERRED_UNTIL`]. The header must not survive
/// into the persisted header map; deferral is expressed through the row's
/// `visible` column instead.
pub fn take_deferred_until(
    headers: &mut HashMap<String, String>,
) -> Result<Option<DateTime<Utc>>, BusError> {
    match headers.remove(HEADER_DEFERRED_UNTIL) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| BusError::MalformedMessage {
                reason: format!(
                    "'{HEADER_DEFERRED_UNTIL}' header value '{raw}' is not an ISO-8601 instant"
                ),
                source: Some(Box::new(e)),
            }),
    }
}

/// TTL from [`HEADER_TIME_TO_BE_RECEIVED`], defaulting to
/// [`DEFAULT_TIME_TO_BE_RECEIVED`].
pub fn time_to_be_received(headers: &HashMap<String, String>) -> Result<Duration, BusError> {
    match headers.get(HEADER_TIME_TO_BE_RECEIVED) {
        None => Ok(DEFAULT_TIME_TO_BE_RECEIVED),
        Some(raw) => parse_timespan(raw).ok_or_else(|| BusError::MalformedMessage {
            reason: format!(
                "'{HEADER_TIME_TO_BE_RECEIVED}' header value '{raw}' is not a duration"
            ),
            source: None,
        }),
    }
}

/// Ordering key from [`HEADER_ORDERING_KEY`], when present.
pub fn ordering_key(headers: &HashMap<String, String>) -> Option<&str> {
    headers.get(HEADER_ORDERING_KEY).map(String::as_str)
}

/// Resolve the effective destination. The timeout-manager sentinel reroutes
/// to [`HEADER_DEFERRED_RECIPIENT`]; a deferred message without a recipient
/// is unroutable and fatal.
pub fn resolve_destination<'a>(
    destination: &'a str,
    headers: &'a HashMap<String, String>,
) -> Result<&'a str, BusError> {
    if destination.eq_ignore_ascii_case(TIMEOUT_MANAGER_ADDRESS) {
        headers
            .get(HEADER_DEFERRED_RECIPIENT)
            .map(String::as_str)
            .ok_or_else(|| BusError::MalformedMessage {
                reason: format!(
                    "deferred message has no '{HEADER_DEFERRED_RECIPIENT}' header to route it to"
                ),
                source: None,
            })
    } else {
        Ok(destination)
    }
}

/// Parse a duration written either as plain integer seconds or in the
/// dotted timespan form `[d.]hh:mm:ss[.frac]`.
pub fn parse_timespan(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(seconds) = input.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    // Optional leading day component: "d.hh:mm:ss".
    let (days, clock) = match input.split_once('.') {
        Some((day_part, rest))
            if rest.contains(':')
                && !day_part.is_empty()
                && day_part.chars().all(|c| c.is_ascii_digit()) =>
        {
            (day_part.parse::<u64>().ok()?, rest)
        }
        _ => (0, input),
    };

    let mut parts = clock.split(':');
    let hours = parts.next()?.parse::<u64>().ok()?;
    let minutes = parts.next()?.parse::<u64>().ok()?;
    let seconds_part = parts.next()?;
    if parts.next().is_some() || minutes >= 60 {
        return None;
    }

    let (seconds_str, fraction_str) = match seconds_part.split_once('.') {
        Some((s, f)) => (s, Some(f)),
        None => (seconds_part, None),
    };
    let seconds = seconds_str.parse::<u64>().ok()?;
    if seconds >= 60 {
        return None;
    }

    let nanos = match fraction_str {
        None => 0,
        Some(f) if f.is_empty() || f.len() > 9 => return None,
        Some(f) => {
            let digits = f.parse::<u64>().ok()?;
            digits * 10u64.pow(9 - f.len() as u32)
        }
    };

    let total_seconds = days * 86_400 + hours * 3_600 + minutes * 60 + seconds;
    Some(Duration::new(total_seconds, nanos as u32))
}
