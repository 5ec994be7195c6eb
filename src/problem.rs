//! RFC 7807-shaped problem-detail payload for a denied decision. Framework
//! wiring (turning this into an actual HTTP response) is left to the
//! embedder — this module only builds the JSON body and the fields a caller
//! needs to set status/headers.

use crate::config::ProblemDetailsConfig;
use crate::engine::Decision;
use uuid::Uuid;

pub struct ProblemDetails {
    pub status: u16,
    pub body: String,
    pub retry_after_secs: u64,
}

pub fn from_decision(decision: &Decision, config: &ProblemDetailsConfig, now_ms: u64) -> ProblemDetails {
    let retry_after_ms = decision.reset_time_ms.saturating_sub(now_ms);
    let retry_after_secs = (retry_after_ms + 999) / 1000;
    let instance = format!("{}{}", config.instance_prefix, Uuid::new_v4());

    let body = format!(
        concat!(
            "{{",
            "\"type\":\"{type_url}\",",
            "\"title\":\"Too Many Requests\",",
            "\"status\":429,",
            "\"detail\":\"rate limit exceeded for limiter '{limiter}'\",",
            "\"instance\":\"{instance}\",",
            "\"retry_after\":{retry_after},",
            "\"limit\":{limit},",
            "\"remaining\":{remaining},",
            "\"reset\":{reset},",
            "\"limiter\":\"{limiter}\"",
            "}}"
        ),
        type_url = json_escape(&config.type_base_url),
        limiter = json_escape(&decision.limiter),
        instance = json_escape(&instance),
        retry_after = retry_after_secs,
        limit = decision.capacity,
        remaining = decision.remaining,
        reset = decision.reset_time_ms,
    );

    ProblemDetails {
        status: 429,
        body,
        retry_after_secs,
    }
}

/// Minimal JSON string escaping: the values we embed (URLs, limiter names,
/// UUIDs) never legitimately contain control characters, but a limiter name
/// is operator-supplied config, not request input, so this is a defense
/// against misconfiguration rather than an external attacker.
fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
