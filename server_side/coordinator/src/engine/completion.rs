//! Deciding that every axis addressed by a dispatched unit has finished.
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use axis_protocol::AxisId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::signals::{Signal, SignalIo};

pub const COMPLETION_TOKEN: &str = "SEQUENCE COMPLETED";
/// How long the all-done line may stay high after arming before it is trusted
/// without having been seen busy.
pub const SETTLE_TIME: Duration = Duration::from_millis(150);

pub trait CompletionDetector {
    /// Starts watching for the addressed `targets` to finish.
    fn arm(&mut self, targets: &[AxisId], now: Instant);
    /// Feeds one line received from the bus. True when it completes the sequence.
    fn on_bus_line(&mut self, line: &str) -> bool;
    /// Checked every tick. True when the sequence has completed.
    fn poll(&mut self, signals: &mut dyn SignalIo, now: Instant) -> bool;
    fn disarm(&mut self);
    fn is_armed(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// Poll the aggregate "all done" input.
    Signal,
    /// Collect one completion reply from every addressed axis.
    Ack,
}

impl CompletionMode {
    pub fn detector(self) -> Box<dyn CompletionDetector> {
        match self {
            CompletionMode::Signal => Box::new(SignalCompletion::new()),
            CompletionMode::Ack => Box::new(AckCompletion::new()),
        }
    }
}

/// The axis a reply such as `y;SEQUENCE COMPLETED` came from.
pub fn reply_target(line: &str) -> Option<AxisId> {
    let (id, _) = line.split_once(';')?;
    AxisId::parse(id.trim())
}

/// Waits for a completion reply from each addressed axis. Replies from axes
/// that were not addressed, or that already answered, are ignored.
#[derive(Debug, Clone)]
pub struct AckCompletion {
    token: String,
    pending: BTreeMap<AxisId, usize>,
}

impl AckCompletion {
    pub fn new() -> Self {
        AckCompletion::with_token(COMPLETION_TOKEN)
    }
    pub fn with_token(token: impl Into<String>) -> Self {
        AckCompletion {
            token: token.into(),
            pending: BTreeMap::new(),
        }
    }
    pub fn remaining(&self) -> usize {
        self.pending.values().sum()
    }
}

impl Default for AckCompletion {
    fn default() -> Self {
        AckCompletion::new()
    }
}

impl CompletionDetector for AckCompletion {
    fn arm(&mut self, targets: &[AxisId], _now: Instant) {
        for &target in targets {
            *self.pending.entry(target).or_default() += 1;
        }
    }
    fn on_bus_line(&mut self, line: &str) -> bool {
        if self.pending.is_empty() || !line.contains(self.token.as_str()) {
            return false;
        }
        let Some(axis) = reply_target(line) else {
            warn!("ignoring completion without an axis id: {:?}", line);
            return false;
        };
        let Some(count) = self.pending.get_mut(&axis) else {
            warn!("ignoring completion from {}, which has nothing in flight", axis);
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.pending.remove(&axis);
        }
        debug!("{} finished, {} replies outstanding", axis, self.remaining());
        if self.pending.is_empty() {
            info!("every addressed axis reported completion");
            return true;
        }
        false
    }
    fn poll(&mut self, _signals: &mut dyn SignalIo, _now: Instant) -> bool {
        false
    }
    fn disarm(&mut self) {
        self.pending.clear();
    }
    fn is_armed(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SignalCompletion {
    armed_at: Option<Instant>,
    seen_busy: bool,
    settle: Duration,
}

impl SignalCompletion {
    pub fn new() -> Self {
        SignalCompletion::with_settle(SETTLE_TIME)
    }
    pub fn with_settle(settle: Duration) -> Self {
        SignalCompletion {
            armed_at: None,
            seen_busy: false,
            settle,
        }
    }
}

impl Default for SignalCompletion {
    fn default() -> Self {
        SignalCompletion::new()
    }
}

impl CompletionDetector for SignalCompletion {
    fn arm(&mut self, _targets: &[AxisId], now: Instant) {
        self.armed_at = Some(now);
        self.seen_busy = false;
    }
    fn on_bus_line(&mut self, _line: &str) -> bool {
        false
    }
    fn poll(&mut self, signals: &mut dyn SignalIo, now: Instant) -> bool {
        let Some(armed_at) = self.armed_at else {
            return false;
        };
        if !signals.read(Signal::AllDone) {
            self.seen_busy = true;
            return false;
        }
        if self.seen_busy || now.saturating_duration_since(armed_at) >= self.settle {
            info!("all-done input confirmed completion");
            self.disarm();
            return true;
        }
        false
    }
    fn disarm(&mut self) {
        self.armed_at = None;
        self.seen_busy = false;
    }
    fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::signals::MemorySignals;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_ack_waits_for_every_addressed_axis() {
        let mut detector = AckCompletion::new();
        let now = Instant::now();
        assert!(!detector.on_bus_line("x;SEQUENCE COMPLETED"));
        detector.arm(&[AxisId::X, AxisId::Y], now);
        assert!(!detector.on_bus_line("x;OK"));
        assert!(!detector.on_bus_line("x;SEQUENCE COMPLETED"));
        assert_eq!(detector.remaining(), 1);
        // X already answered and Z was never addressed.
        assert!(!detector.on_bus_line("x;SEQUENCE COMPLETED"));
        assert!(!detector.on_bus_line("z;SEQUENCE COMPLETED"));
        assert!(!detector.on_bus_line("SEQUENCE COMPLETED"));
        assert_eq!(detector.remaining(), 1);
        assert!(detector.on_bus_line("y;SEQUENCE COMPLETED"));
        assert!(!detector.is_armed());
    }
    #[test]
    fn test_ack_rearm_adds_up() {
        let mut detector = AckCompletion::new();
        let now = Instant::now();
        detector.arm(&[AxisId::X], now);
        detector.arm(&[AxisId::X, AxisId::G], now);
        assert!(!detector.on_bus_line("x;SEQUENCE COMPLETED"));
        assert!(!detector.on_bus_line("g;SEQUENCE COMPLETED"));
        assert!(detector.on_bus_line("X ; SEQUENCE COMPLETED"));
    }
    #[test]
    fn test_reply_target() {
        assert_eq!(reply_target("t;SEQUENCE COMPLETED"), Some(AxisId::T));
        assert_eq!(reply_target("q;SEQUENCE COMPLETED"), None);
        assert_eq!(reply_target("SEQUENCE COMPLETED"), None);
    }
    #[test]
    fn test_signal_needs_busy_or_settle() {
        let handle = MemorySignals::new(0);
        let mut signals = handle.clone();
        let mut detector = SignalCompletion::new();
        let start = Instant::now();
        assert!(!detector.poll(&mut signals, start));

        // Line still high from the previous move: not trusted yet.
        handle.set(Signal::AllDone, true);
        detector.arm(&AxisId::ALL, start);
        assert!(!detector.poll(&mut signals, start + ms(10)));
        handle.set(Signal::AllDone, false);
        assert!(!detector.poll(&mut signals, start + ms(20)));
        handle.set(Signal::AllDone, true);
        assert!(detector.poll(&mut signals, start + ms(30)));
        assert!(!detector.is_armed());
    }
    #[test]
    fn test_signal_settle_time() {
        let handle = MemorySignals::new(0);
        let mut signals = handle.clone();
        let mut detector = SignalCompletion::new();
        let start = Instant::now();
        handle.set(Signal::AllDone, true);
        detector.arm(&[AxisId::X], start);
        assert!(!detector.poll(&mut signals, start + ms(149)));
        assert!(detector.poll(&mut signals, start + ms(150)));
    }
}
