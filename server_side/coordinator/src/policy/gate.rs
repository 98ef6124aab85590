use std::time::{Duration, Instant};

pub const DETECT_DEBOUNCE: Duration = Duration::from_millis(1000);
pub const DETECT_TIMEOUT: Duration = Duration::from_millis(10000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Pending,
    Confirmed,
    TimedOut,
}

/// `WAIT`: released by the sync input going active.
#[derive(Debug, Clone)]
pub struct WaitGate {
    started_at: Instant,
    max_wait: Duration,
}

impl WaitGate {
    pub fn new(max_wait: Duration, now: Instant) -> Self {
        WaitGate { started_at: now, max_wait }
    }
    pub fn poll(&mut self, active: bool, now: Instant) -> GateStatus {
        if active {
            GateStatus::Confirmed
        } else if now.saturating_duration_since(self.started_at) >= self.max_wait {
            GateStatus::TimedOut
        } else {
            GateStatus::Pending
        }
    }
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
    pub fn restart(&mut self, now: Instant) {
        self.started_at = now;
    }
}

/// `DETECT`: released once every sensor has read triggered for the whole
/// debounce window. Any sensor dropping out restarts the window.
#[derive(Debug, Clone)]
pub struct DetectGate {
    started_at: Instant,
    debounce: Duration,
    timeout: Duration,
    triggered_since: Option<Instant>,
}

impl DetectGate {
    pub fn new(now: Instant) -> Self {
        DetectGate::with_timing(DETECT_DEBOUNCE, DETECT_TIMEOUT, now)
    }
    pub fn with_timing(debounce: Duration, timeout: Duration, now: Instant) -> Self {
        DetectGate {
            started_at: now,
            debounce,
            timeout,
            triggered_since: None,
        }
    }
    pub fn poll(&mut self, all_triggered: bool, now: Instant) -> GateStatus {
        if all_triggered {
            let since = *self.triggered_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.debounce {
                return GateStatus::Confirmed;
            }
        } else {
            self.triggered_since = None;
        }
        if now.saturating_duration_since(self.started_at) >= self.timeout {
            GateStatus::TimedOut
        } else {
            GateStatus::Pending
        }
    }
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
    pub fn restart(&mut self, now: Instant) {
        self.started_at = now;
        self.triggered_since = None;
    }
}
