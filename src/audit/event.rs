/// What kind of thing happened. Enforcement decisions are sampled per the
/// rate-limiting rule in `should_log`; configuration changes and system
/// failures are always logged in full — an operator must never miss a
/// reload or a backend outage just because a noisy limiter ate the sample
/// budget for that minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventKind {
    ConfigChange,
    Enforcement,
    SystemFailure,
}

impl AuditEventKind {
    pub fn always_logged(self) -> bool {
        !matches!(self, AuditEventKind::Enforcement)
    }
}

/// One rate-limit decision, already PII-masked, ready to hand to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub kind: AuditEventKind,
    pub limiter: String,
    pub masked_key: String,
    pub allowed: bool,
    pub remaining: u64,
    pub reset_time_ms: u64,
    pub delay_ms: u64,
    pub timestamp_ms: u64,
}

/// Rolled-up counters for a limiter over one summary interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub allowed: u64,
    pub denied: u64,
    pub dropped: u64,
}
