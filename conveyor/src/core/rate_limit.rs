//! Throughput-exhaustion detection and backoff computation.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::core::envelope::Envelope;

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)rate[\s_-]?limit|too many requests|usage limit|quota exceeded|overloaded|\b429\b",
    )
    .expect("valid regex")
});
static RETRY_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry[\s_-]?after\D{0,10}(\d+)").expect("valid regex")
});
static WAIT_MINUTES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:wait|try again in|retry in)\s+(\d+)\s*(?:minutes?|mins?)\b")
        .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Used when the response names no wait time.
    pub default_wait: Duration,
    /// Always added on top of the computed wait.
    pub buffer: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            default_wait: Duration::from_secs(300),
            buffer: Duration::from_secs(30),
        }
    }
}

/// Whether the envelope reports throughput exhaustion.
///
/// An explicit structured status decides first. Text heuristics only run on
/// responses the executor itself flagged as errors, so a successful stage
/// that merely mentions "rate limit" is never retried.
pub fn is_rate_limited(envelope: &Envelope) -> bool {
    match envelope.structured_status() {
        Some("success") => return false,
        Some("rate_limit") => return true,
        _ => {}
    }
    envelope.is_error && text_indicates_rate_limit(&envelope.search_text())
}

pub fn text_indicates_rate_limit(text: &str) -> bool {
    RATE_LIMIT_RE.is_match(text)
}

/// How long to sleep before retrying.
pub fn wait_time(text: &str, policy: &BackoffPolicy) -> Duration {
    let base = if let Some(secs) = capture_u64(&RETRY_AFTER_RE, text) {
        Duration::from_secs(secs)
    } else if let Some(minutes) = capture_u64(&WAIT_MINUTES_RE, text) {
        Duration::from_secs(minutes.saturating_mul(60))
    } else {
        policy.default_wait
    };
    base + policy.buffer
}

fn capture_u64(re: &Regex, text: &str) -> Option<u64> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn error_envelope(text: &str) -> Envelope {
        Envelope {
            is_error: true,
            result: Some(text.to_string()),
            ..Envelope::default()
        }
    }

    #[test]
    fn structured_status_overrides_text() {
        let mut envelope = error_envelope("rate limit exceeded");
        envelope.structured_output = Some(json!({"status": "success"}));
        assert!(!is_rate_limited(&envelope));

        let explicit = Envelope {
            structured_output: Some(json!({"status": "rate_limit"})),
            ..Envelope::default()
        };
        assert!(is_rate_limited(&explicit));
    }

    #[test]
    fn heuristics_only_apply_to_error_responses() {
        let ok = Envelope {
            is_error: false,
            result: Some("Added rate limit handling to the client".to_string()),
            ..Envelope::default()
        };
        assert!(!is_rate_limited(&ok));
        assert!(is_rate_limited(&error_envelope("Too Many Requests")));
        assert!(is_rate_limited(&error_envelope("HTTP 429 from upstream")));
        assert!(is_rate_limited(&error_envelope("API is Overloaded")));
        assert!(!is_rate_limited(&error_envelope("compilation failed")));
    }

    #[test]
    fn wait_prefers_retry_after_then_minutes_then_default() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            wait_time("retry-after: 12", &policy),
            Duration::from_secs(12 + 30)
        );
        assert_eq!(
            wait_time("usage limit; please wait 3 minutes", &policy),
            Duration::from_secs(180 + 30)
        );
        assert_eq!(
            wait_time("quota exceeded", &policy),
            Duration::from_secs(300 + 30)
        );
    }

    #[test]
    fn buffer_is_always_added() {
        let policy = BackoffPolicy {
            default_wait: Duration::ZERO,
            buffer: Duration::from_secs(7),
        };
        assert_eq!(wait_time("", &policy), Duration::from_secs(7));
    }
}
