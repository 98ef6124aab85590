//! The execution engine: owns the queue and every device-facing component and
//! decides, one tick at a time, what goes to the bus next.
//!
//! The engine does no IO of its own. Outgoing lines pile up in the protocol
//! until [`Engine::take_outgoing`] is called, received lines come in through
//! [`Engine::on_bus_line`], and every operation takes the current time.
pub mod completion;
pub mod dispatch;
pub mod state;

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    policy::{
        admin::{is_admin, parse_admin},
        BlockKind, DetectGate, GateStatus, PolicySnapshot, TimeoutOutcome, TimeoutPolicy, WaitGate,
    },
    protocol::Protocol,
    queue::CommandQueue,
    script::{ExpandedStatement, Interpreter, ScriptGuard, SystemCommand},
    signals::{Signal, SignalIo},
};

pub use completion::{AckCompletion, CompletionDetector, CompletionMode, SignalCompletion};
pub use dispatch::{Dispatcher, Issued};
pub use state::{transition, SystemState, Transition};

/// A repeated system command inside this window is ignored.
pub const SYSTEM_REPEAT_WINDOW: Duration = Duration::from_millis(200);
const DISPATCH_BUDGET: usize = 16;
const DIRECT_PREFIX: &str = "DIRECT:";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInfo {
    pub total_commands: usize,
    pub current_command: usize,
    pub executing: bool,
    pub started_at: Option<DateTime<Local>>,
    pub function: Option<String>,
    pub depth: usize,
    #[serde(skip)]
    started: Option<Instant>,
}

struct InFlight {
    statement: String,
    dispatched_at: Instant,
}

enum Gate {
    Wait(WaitGate),
    Detect(DetectGate),
}

struct Blocking {
    kind: BlockKind,
    gate: Gate,
}

impl Blocking {
    fn new(kind: BlockKind, max_wait: Duration, now: Instant) -> Self {
        let gate = match kind {
            BlockKind::Wait => Gate::Wait(WaitGate::new(max_wait, now)),
            BlockKind::Detect => Gate::Detect(DetectGate::new(now)),
        };
        Blocking { kind, gate }
    }
    fn started_at(&self) -> Instant {
        match &self.gate {
            Gate::Wait(gate) => gate.started_at(),
            Gate::Detect(gate) => gate.started_at(),
        }
    }
    fn restart(&mut self, now: Instant) {
        match &mut self.gate {
            Gate::Wait(gate) => gate.restart(now),
            Gate::Detect(gate) => gate.restart(now),
        }
    }
}

/// A queue entry that had to go through the interpreter. The guard keeps
/// other scripts out until every statement has run.
struct NestedRun {
    statements: VecDeque<ExpandedStatement>,
    _guard: ScriptGuard,
}

/// What became of a line handed to [`Engine::submit_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intake {
    State(SystemState),
    Repeated,
    Queued { accepted: usize, rejected: usize },
    Direct { issued: usize },
    Admin,
    Status,
    Refused(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: SystemState,
    pub queued: usize,
    pub in_flight: Option<String>,
    pub blocked_on: Option<BlockKind>,
    pub execution: ExecutionInfo,
    pub timeouts: PolicySnapshot,
}

/// Everything the engine is built from.
pub struct EngineParts {
    pub queue: CommandQueue,
    pub protocol: Protocol,
    pub signals: Box<dyn SignalIo>,
    pub detector: Box<dyn CompletionDetector>,
    pub policy: TimeoutPolicy,
}

pub struct Engine {
    state: SystemState,
    queue: CommandQueue,
    interpreter: Interpreter,
    dispatcher: Dispatcher,
    detector: Box<dyn CompletionDetector>,
    policy: TimeoutPolicy,
    in_flight: Option<InFlight>,
    blocking: Option<Blocking>,
    nested: Option<NestedRun>,
    info: ExecutionInfo,
    last_system: Option<(SystemCommand, Instant)>,
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        Engine {
            state: SystemState::Idle,
            queue: parts.queue,
            interpreter: Interpreter::new(),
            dispatcher: Dispatcher::new(parts.protocol, parts.signals),
            detector: parts.detector,
            policy: parts.policy,
            in_flight: None,
            blocking: None,
            nested: None,
            info: Default::default(),
            last_system: None,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }
    pub fn info(&self) -> &ExecutionInfo {
        &self.info
    }
    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }
    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|flight| flight.statement.as_str())
    }
    pub fn blocked_on(&self) -> Option<BlockKind> {
        self.blocking.as_ref().map(|blocking| blocking.kind)
    }
    /// True when there is nothing left to do until new input arrives.
    pub fn is_settled(&self) -> bool {
        self.state == SystemState::Idle
            && self.in_flight.is_none()
            && self.queue.is_empty()
            && !self.dispatcher.protocol().has_open_batch()
    }

    /// Lines for the bus, oldest first.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        self.dispatcher.protocol_mut().take_outgoing()
    }
    /// When the open batch has to be flushed, if there is one.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.dispatcher.protocol().flush_deadline()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.state,
            queued: self.queue.len(),
            in_flight: self.in_flight().map(str::to_string),
            blocked_on: self.blocked_on(),
            execution: self.info.clone(),
            timeouts: self.policy.snapshot(),
        }
    }

    /// Handles one line from the operator console.
    pub fn submit_command(&mut self, text: &str, now: Instant) -> Intake {
        let text = text.trim();
        if text.is_empty() {
            return Intake::Refused("empty command".to_string());
        }
        if let Some(command) = SystemCommand::parse(text) {
            return self.system_command(command, now);
        }
        if is_admin(text) {
            return match parse_admin(text) {
                Some(command) => match self.policy.apply(command) {
                    Ok(()) => Intake::Admin,
                    Err(e) => {
                        warn!("timeout command {:?} failed: {:#}", text, e);
                        Intake::Refused(e.to_string())
                    }
                },
                None => {
                    warn!("unrecognized timeout command {:?}", text);
                    Intake::Refused(format!("unrecognized timeout command {:?}", text))
                }
            };
        }
        if text.eq_ignore_ascii_case("STATUS") {
            match serde_json::to_string(&self.status()) {
                Ok(json) => info!("status: {}", json),
                Err(e) => error!("failed to render status: {}", e),
            }
            return Intake::Status;
        }
        if let Some(script) = strip_prefix_ignore_case(text, DIRECT_PREFIX) {
            return self.run_direct(script, now);
        }
        self.queue_script(text, now)
    }

    /// PLAY, PAUSE, STOP or IDLE from the console, with repeats suppressed.
    pub fn system_command(&mut self, command: SystemCommand, now: Instant) -> Intake {
        if let Some((last, at)) = self.last_system {
            if last == command && now.saturating_duration_since(at) < SYSTEM_REPEAT_WINDOW {
                info!("ignoring repeated {}", command);
                return Intake::Repeated;
            }
        }
        self.last_system = Some((command, now));
        self.apply_system(command, now);
        Intake::State(self.state)
    }

    fn apply_system(&mut self, command: SystemCommand, now: Instant) {
        let Some(step) = transition(self.state, command, self.in_flight.is_some()) else {
            info!("{} has no effect while {}", command, self.state);
            return;
        };
        if step.clear_queue {
            self.clear_pending();
        }
        if step.to == SystemState::Idle {
            self.abandon_in_flight();
        }
        match (self.state, step.to) {
            (SystemState::Idle, SystemState::Running) => {
                if !self.start_run(now) {
                    return;
                }
            }
            (SystemState::Paused, SystemState::Running) => {
                if let Some(blocking) = &mut self.blocking {
                    blocking.restart(now);
                }
            }
            (_, SystemState::Idle) => self.info.executing = false,
            _ => {}
        }
        info!("{} -> {}", self.state, step.to);
        self.state = step.to;
    }

    fn start_run(&mut self, now: Instant) -> bool {
        if self.queue.is_empty() {
            if let Err(e) = self.queue.reload() {
                error!("failed to reload the queue: {:#}", e);
            }
        }
        if self.queue.is_empty() {
            info!("PLAY with nothing queued; staying IDLE");
            return false;
        }
        self.info = ExecutionInfo {
            total_commands: self.queue.len(),
            executing: true,
            started_at: Some(Local::now()),
            started: Some(now),
            ..Default::default()
        };
        true
    }

    fn abandon_in_flight(&mut self) {
        self.detector.disarm();
        if let Some(flight) = self.in_flight.take() {
            warn!("giving up on {} without a completion", flight.statement);
        }
    }

    fn clear_pending(&mut self) {
        if !self.queue.is_empty() {
            info!("clearing {} queued commands", self.queue.len());
        }
        self.queue.clear();
        self.nested = None;
        self.blocking = None;
    }

    fn queue_script(&mut self, script: &str, now: Instant) -> Intake {
        let statements = match self.interpreter.expand(script) {
            Ok((statements, _)) => statements,
            Err(e) => return Intake::Refused(e.to_string()),
        };
        let before = self.queue.len();
        let single = statements.len() == 1;
        let mut rejected = 0;
        for statement in &statements {
            let stored = if single {
                self.queue.enqueue(&statement.text, now)
            } else {
                self.queue.append(&statement.text)
            };
            if !stored {
                rejected += 1;
            }
        }
        let added = self.queue.len() - before;
        if matches!(self.state, SystemState::Running | SystemState::Paused) {
            self.info.total_commands += added;
        }
        info!("queued {} commands, {} pending", added, self.queue.len());
        Intake::Queued {
            accepted: statements.len() - rejected,
            rejected,
        }
    }

    /// Runs `script` straight to the bus, bypassing the queue. The motions it
    /// sends count as one unit in flight until every addressed axis is done.
    fn run_direct(&mut self, script: &str, now: Instant) -> Intake {
        if matches!(self.state, SystemState::Running | SystemState::Stopping) || self.in_flight.is_some() {
            warn!("direct mode refused while {}", self.state);
            return Intake::Refused(format!("direct mode is not available while {}", self.state));
        }
        let dispatcher = &mut self.dispatcher;
        let mut issued = 0;
        let mut system = Vec::new();
        let mut targets = Vec::new();
        let mut sink = |statement: ExpandedStatement| match dispatcher.issue(&statement.text, now) {
            Issued::Motion(axes) => {
                issued += 1;
                targets.extend(axes);
            }
            Issued::Configured => issued += 1,
            Issued::Block(kind) => warn!("{} cannot block in direct mode; skipping it", kind),
            Issued::System(command) => system.push(command),
            Issued::Nested => warn!("skipping nested statement {:?}", statement.text),
            Issued::Skipped => {}
        };
        let result = self.interpreter.parse(script, &mut sink);
        if let Err(e) = result {
            return Intake::Refused(e.to_string());
        }
        dispatcher.protocol_mut().flush();
        if !targets.is_empty() {
            self.detector.arm(&targets, now);
            self.in_flight = Some(InFlight {
                statement: format!("{}{}", DIRECT_PREFIX, script),
                dispatched_at: now,
            });
        }
        for command in system {
            self.apply_system(command, now);
        }
        info!("direct mode issued {} commands", issued);
        Intake::Direct { issued }
    }

    /// Feeds one line received from the axes.
    pub fn on_bus_line(&mut self, line: &str, now: Instant) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if line.contains("ERR") {
            warn!("axis reported {:?}", line);
        }
        if self.detector.on_bus_line(line) && self.in_flight.is_some() {
            self.sequence_finished(now);
        }
    }

    /// Every axis addressed by the in-flight unit has finished.
    pub fn sequence_finished(&mut self, now: Instant) {
        self.detector.disarm();
        let Some(done) = self.in_flight.take() else {
            return;
        };
        info!(
            "{} finished after {} ms",
            done.statement,
            now.saturating_duration_since(done.dispatched_at).as_millis()
        );
        if self.state == SystemState::Stopping {
            info!("{} -> {}", self.state, SystemState::Idle);
            self.state = SystemState::Idle;
            self.info.executing = false;
        }
    }

    pub fn tick(&mut self, now: Instant) {
        self.dispatcher.protocol_mut().poll(now);
        if self.in_flight.is_some() && self.detector.poll(self.dispatcher.signals_mut(), now) {
            self.sequence_finished(now);
        }
        if self.state == SystemState::Running {
            self.resolve_blocking(now);
            self.advance(now);
        }
    }

    fn resolve_blocking(&mut self, now: Instant) {
        let Some(blocking) = self.blocking.as_mut() else {
            return;
        };
        let signals = self.dispatcher.signals_mut();
        let status = match &mut blocking.gate {
            Gate::Wait(gate) => gate.poll(signals.read(Signal::SyncIn), now),
            Gate::Detect(gate) => gate.poll(signals.all_sensors_triggered(), now),
        };
        let kind = blocking.kind;
        let waited = now.saturating_duration_since(blocking.started_at());
        match status {
            GateStatus::Pending => {}
            GateStatus::Confirmed => {
                self.policy.on_success(kind, waited);
                self.blocking = None;
            }
            GateStatus::TimedOut => match self.policy.on_timeout(kind, waited) {
                TimeoutOutcome::Continue => self.blocking = None,
                TimeoutOutcome::Retry => {
                    if let Some(blocking) = &mut self.blocking {
                        blocking.restart(now);
                    }
                }
                TimeoutOutcome::Pause => {
                    self.blocking = None;
                    info!("{} -> {}", self.state, SystemState::Paused);
                    self.state = SystemState::Paused;
                }
                TimeoutOutcome::AbortAndReset => {
                    self.clear_pending();
                    info!("{} -> {}", self.state, SystemState::Idle);
                    self.state = SystemState::Idle;
                    self.info.executing = false;
                }
            },
        }
    }

    fn advance(&mut self, now: Instant) {
        for _ in 0..DISPATCH_BUDGET {
            if self.state != SystemState::Running || self.in_flight.is_some() || self.blocking.is_some() {
                return;
            }
            let Some(statement) = self.next_statement() else {
                self.finish_run(now);
                return;
            };
            self.execute(statement, now);
        }
    }

    fn next_statement(&mut self) -> Option<ExpandedStatement> {
        if let Some(run) = &mut self.nested {
            if let Some(statement) = run.statements.pop_front() {
                return Some(statement);
            }
            self.nested = None;
        }
        let text = self.queue.dequeue()?;
        self.info.current_command += 1;
        self.info.total_commands = self.info.total_commands.max(self.info.current_command);
        Some(ExpandedStatement::top_level(text))
    }

    fn execute(&mut self, statement: ExpandedStatement, now: Instant) {
        self.info.function = statement.function.clone();
        self.info.depth = statement.depth;
        match self.dispatcher.issue(&statement.text, now) {
            Issued::Motion(axes) => {
                info!("dispatched {} to {} axes", statement.text, axes.len());
                self.detector.arm(&axes, now);
                self.in_flight = Some(InFlight {
                    statement: statement.text,
                    dispatched_at: now,
                });
            }
            Issued::Configured | Issued::Skipped => {}
            Issued::Block(kind) => {
                info!("blocking on {}", kind);
                self.blocking = Some(Blocking::new(kind, self.policy.max_wait(), now));
            }
            Issued::System(command) => self.apply_system(command, now),
            Issued::Nested => self.start_nested(&statement.text),
        }
    }

    fn start_nested(&mut self, text: &str) {
        let mut statements = VecDeque::new();
        if let Err(e) = self
            .interpreter
            .expand_nested(text, &mut |statement| statements.push_back(statement))
        {
            warn!("cannot expand {:?}: {}", text, e);
            return;
        }
        if statements.is_empty() {
            return;
        }
        match self.interpreter.guard() {
            Ok(guard) => {
                self.nested = Some(NestedRun {
                    statements,
                    _guard: guard,
                })
            }
            Err(e) => warn!("cannot run {:?}: {}", text, e),
        }
    }

    fn finish_run(&mut self, now: Instant) {
        let elapsed = self
            .info
            .started
            .map_or(Duration::ZERO, |started| now.saturating_duration_since(started));
        info!(
            "queue finished: {} commands in {:.1} s",
            self.info.current_command,
            elapsed.as_secs_f64()
        );
        info!("{} -> {}", self.state, SystemState::Idle);
        self.state = SystemState::Idle;
        self.info.executing = false;
        self.info.function = None;
        self.info.depth = 0;
    }
}

#[cfg(test)]
mod test {
    use tempdir::TempDir;

    use super::*;
    use crate::{
        policy::{TimeoutConfig, TimeoutStrategy},
        protocol::ProtocolConfig,
        queue::DEFAULT_CAPACITY,
        signals::MemorySignals,
    };

    struct Bench {
        engine: Engine,
        signals: MemorySignals,
        dir: TempDir,
        start: Instant,
    }

    impl Bench {
        fn new(protocol: ProtocolConfig, timeouts: TimeoutConfig) -> Bench {
            Bench::with_detector(protocol, timeouts, Box::new(AckCompletion::new()))
        }
        fn with_detector(
            protocol: ProtocolConfig,
            timeouts: TimeoutConfig,
            detector: Box<dyn CompletionDetector>,
        ) -> Bench {
            let dir = TempDir::new("engine").unwrap();
            let signals = MemorySignals::new(2);
            let engine = Engine::new(EngineParts {
                queue: CommandQueue::open_in(dir.path(), DEFAULT_CAPACITY).unwrap(),
                protocol: Protocol::new(protocol),
                signals: Box::new(signals.clone()),
                detector,
                policy: TimeoutPolicy::new(timeouts),
            });
            Bench {
                engine,
                signals,
                dir,
                start: Instant::now(),
            }
        }
        fn legacy() -> Bench {
            Bench::new(ProtocolConfig::legacy(), Default::default())
        }
        fn at(&self, millis: u64) -> Instant {
            self.start + Duration::from_millis(millis)
        }
        fn submit(&mut self, text: &str, millis: u64) -> Intake {
            let now = self.at(millis);
            self.engine.submit_command(text, now)
        }
        fn tick(&mut self, millis: u64) -> Vec<String> {
            let now = self.at(millis);
            self.engine.tick(now);
            self.engine.take_outgoing()
        }
        fn complete(&mut self, axes: &[&str], millis: u64) {
            let now = self.at(millis);
            for axis in axes {
                self.engine.on_bus_line(&format!("{};SEQUENCE COMPLETED", axis), now);
            }
        }
    }

    fn timeouts(strategy: TimeoutStrategy, max_wait_time: u64) -> TimeoutConfig {
        TimeoutConfig {
            max_wait_time,
            strategy,
            ..Default::default()
        }
    }

    #[test]
    fn test_scenario_runs_one_unit_at_a_time() {
        let mut bench = Bench::legacy();
        assert_eq!(
            bench.submit("ZERO;X(100);GROUP(Y(50),Z(10));WAIT;", 0),
            Intake::Queued { accepted: 4, rejected: 0 }
        );
        assert_eq!(bench.engine.queue().len(), 4);
        assert_eq!(bench.submit("PLAY", 1), Intake::State(SystemState::Running));

        assert_eq!(bench.tick(2), vec!["x;2", "y;2", "z;2", "t;2", "g;2"]);
        assert!(bench.tick(3).is_empty());
        bench.complete(&["x", "y", "z", "t"], 4);
        assert!(bench.tick(5).is_empty());
        bench.complete(&["g"], 6);
        assert_eq!(bench.tick(7), vec!["x;1;100"]);
        bench.complete(&["x"], 8);
        assert_eq!(bench.tick(9), vec!["y;9;50", "z;9;10"]);
        bench.complete(&["y", "z"], 10);
        assert!(bench.tick(11).is_empty());
        assert_eq!(bench.engine.blocked_on(), Some(BlockKind::Wait));

        bench.signals.set(Signal::SyncIn, true);
        bench.tick(20);
        assert_eq!(bench.engine.blocked_on(), None);
        assert_eq!(bench.engine.state(), SystemState::Idle);
        assert_eq!(bench.engine.info().current_command, 4);
        assert_eq!(bench.engine.info().total_commands, 4);
        assert!(!bench.engine.info().executing);
        assert_eq!(bench.engine.policy().stats().successful_waits, 1);
    }

    #[test]
    fn test_batched_coordinate_move() {
        let mut bench = Bench::new(ProtocolConfig::default(), Default::default());
        bench.submit("X(100)Y(50)", 0);
        bench.submit("PLAY", 1);
        assert_eq!(bench.tick(2), vec!["#x;1;100,y;1;50*EA#"]);
        assert_eq!(bench.engine.in_flight(), Some("X(100)Y(50)"));
    }

    #[test]
    fn test_speed_does_not_block() {
        let mut bench = Bench::legacy();
        bench.submit("SPEED;500;SPEED;x;700;X(1)", 0);
        assert_eq!(bench.engine.queue().len(), 3);
        bench.submit("PLAY", 1);
        assert_eq!(
            bench.tick(2),
            vec!["x;6;500", "y;6;500", "z;6;500", "t;6;500", "g;6;500", "x;6;700", "x;1;1"]
        );
    }

    #[test]
    fn test_stop_while_in_flight() {
        let mut bench = Bench::legacy();
        bench.submit("X(1);Y(2)", 0);
        bench.submit("PLAY", 1);
        assert_eq!(bench.tick(2), vec!["x;1;1"]);
        assert_eq!(bench.submit("STOP", 3), Intake::State(SystemState::Stopping));
        assert!(bench.engine.queue().is_empty());
        assert!(bench.tick(4).is_empty());
        bench.complete(&["x"], 5);
        assert_eq!(bench.engine.state(), SystemState::Idle);
        assert!(bench.tick(6).is_empty());
    }

    #[test]
    fn test_second_stop_gives_up_on_a_silent_axis() {
        let mut bench = Bench::legacy();
        bench.submit("X(1);Y(2)", 0);
        bench.submit("PLAY", 1);
        assert_eq!(bench.tick(2), vec!["x;1;1"]);
        assert_eq!(bench.submit("STOP", 3), Intake::State(SystemState::Stopping));
        assert_eq!(bench.submit("PLAY", 4), Intake::State(SystemState::Stopping));
        assert_eq!(bench.submit("STOP", 300), Intake::State(SystemState::Idle));
        assert_eq!(bench.engine.in_flight(), None);
        assert!(bench.engine.is_settled());

        bench.submit("Z(3)", 400);
        bench.submit("PLAY", 401);
        assert_eq!(bench.tick(402), vec!["z;1;3"]);
        // The reply the abandoned move owed does not stand in for Z.
        bench.complete(&["x"], 403);
        assert_eq!(bench.engine.in_flight(), Some("Z(3)"));
    }

    #[test]
    fn test_stop_while_idle_clears_the_queue() {
        let mut bench = Bench::legacy();
        bench.submit("X(1);Y(2)", 0);
        assert_eq!(bench.submit("STOP", 1), Intake::State(SystemState::Idle));
        assert!(bench.engine.queue().is_empty());
        assert_eq!(bench.submit("PLAY", 2), Intake::State(SystemState::Idle));
    }

    #[test]
    fn test_pause_holds_the_queue() {
        let mut bench = Bench::legacy();
        bench.submit("X(1);Y(2)", 0);
        bench.submit("PLAY", 1);
        bench.tick(2);
        assert_eq!(bench.submit("PAUSE", 3), Intake::State(SystemState::Paused));
        bench.complete(&["x"], 4);
        assert!(bench.tick(5).is_empty());
        assert_eq!(bench.submit("PLAY", 300), Intake::State(SystemState::Running));
        assert_eq!(bench.tick(301), vec!["y;1;2"]);
    }

    #[test]
    fn test_repeated_system_commands() {
        let mut bench = Bench::legacy();
        assert_eq!(bench.submit("STOP", 0), Intake::State(SystemState::Idle));
        assert_eq!(bench.submit("stop", 100), Intake::Repeated);
        assert_eq!(bench.submit("STOP", 300), Intake::State(SystemState::Idle));
    }

    #[test]
    fn test_play_reloads_from_disk() {
        let mut bench = Bench::legacy();
        {
            let mut other = CommandQueue::open_in(bench.dir.path(), DEFAULT_CAPACITY).unwrap();
            assert!(other.append("FUNC(a){Y(2)};X(1);CALL(a)"));
        }
        assert_eq!(bench.submit("PLAY", 0), Intake::State(SystemState::Running));
        assert_eq!(bench.tick(1), vec!["x;1;1"]);
        // The nested entry holds the interpreter until it is done.
        assert!(matches!(bench.submit("Z(3)", 2), Intake::Refused(_)));
        bench.complete(&["x"], 3);
        assert_eq!(bench.tick(4), vec!["y;1;2"]);
        assert_eq!(bench.engine.info().function.as_deref(), Some("a"));
        assert_eq!(bench.engine.info().depth, 1);
        bench.complete(&["y"], 5);
        bench.tick(6);
        assert_eq!(bench.engine.state(), SystemState::Idle);
        assert_eq!(bench.submit("Z(3)", 7), Intake::Queued { accepted: 1, rejected: 0 });
    }

    #[test]
    fn test_direct_mode() {
        let mut bench = Bench::legacy();
        assert_eq!(
            bench.submit("DIRECT:X(1);WAIT;SPEED;y;5;Y(2)", 0),
            Intake::Direct { issued: 3 }
        );
        assert_eq!(bench.engine.take_outgoing(), vec!["x;1;1", "y;6;5", "y;1;2"]);
        assert_eq!(bench.engine.in_flight(), Some("DIRECT:X(1);WAIT;SPEED;y;5;Y(2)"));
        assert!(bench.engine.queue().is_empty());
        assert!(matches!(bench.submit("DIRECT:Z(1)", 1), Intake::Refused(_)));

        bench.complete(&["x", "y"], 2);
        assert_eq!(bench.engine.in_flight(), None);
        bench.submit("X(5)", 3);
        bench.submit("PLAY", 4);
        assert_eq!(bench.tick(5), vec!["x;1;5"]);
        assert!(matches!(bench.submit("direct:Y(1)", 6), Intake::Refused(_)));
    }

    #[test]
    fn test_queued_run_waits_for_direct_motion() {
        let mut bench = Bench::legacy();
        assert_eq!(bench.submit("DIRECT:X(1)", 0), Intake::Direct { issued: 1 });
        assert_eq!(bench.engine.take_outgoing(), vec!["x;1;1"]);
        bench.submit("Y(2);Z(3)", 1);
        bench.submit("PLAY", 2);
        assert!(bench.tick(3).is_empty());

        bench.complete(&["x"], 4);
        assert_eq!(bench.tick(5), vec!["y;1;2"]);
        // A second reply from X, or one from an idle axis, is not Y's.
        bench.complete(&["x", "g"], 6);
        assert!(bench.tick(7).is_empty());
        assert_eq!(bench.engine.in_flight(), Some("Y(2)"));
        bench.complete(&["y"], 8);
        assert_eq!(bench.tick(9), vec!["z;1;3"]);
    }

    #[test]
    fn test_direct_and_queued_emit_the_same_traffic() {
        let script = "FUNC(p){X(1);GROUP(Y(2),Z(3))};CALL(p);SPEED;50;T(4);CALL(p)";

        let mut direct = Bench::new(ProtocolConfig::default(), Default::default());
        direct.submit(&format!("DIRECT:{}", script), 0);
        let direct_lines = direct.engine.take_outgoing();

        let mut queued = Bench::new(ProtocolConfig::default(), Default::default());
        queued.submit(script, 0);
        queued.submit("PLAY", 1);
        let mut queued_lines = Vec::new();
        for step in 0..10 {
            queued_lines.extend(queued.tick(10 * step + 2));
            queued.complete(&["x", "y", "z", "t", "g"], 10 * step + 3);
        }
        assert_eq!(queued.engine.state(), SystemState::Idle);
        assert_eq!(direct_lines, queued_lines);
    }

    #[test]
    fn test_wait_retries_then_pauses() {
        let mut bench = Bench::new(ProtocolConfig::legacy(), timeouts(TimeoutStrategy::RetryBackoff, 100));
        bench.submit("WAIT;X(1)", 0);
        bench.submit("PLAY", 0);
        bench.tick(0);
        assert_eq!(bench.engine.blocked_on(), Some(BlockKind::Wait));
        bench.tick(100);
        bench.tick(200);
        assert_eq!(bench.engine.state(), SystemState::Running);
        bench.tick(300);
        assert_eq!(bench.engine.state(), SystemState::Paused);
        assert_eq!(bench.engine.policy().stats().total_timeouts, 3);
        assert_eq!(bench.engine.policy().stats().retry_count, 2);

        assert_eq!(bench.submit("PLAY", 400), Intake::State(SystemState::Running));
        assert_eq!(bench.tick(401), vec!["x;1;1"]);
    }

    #[test]
    fn test_wait_timeout_aborts() {
        let mut bench = Bench::new(ProtocolConfig::legacy(), timeouts(TimeoutStrategy::AbortReset, 100));
        bench.submit("WAIT;X(1);Y(2)", 0);
        bench.submit("PLAY", 0);
        bench.tick(0);
        assert!(bench.tick(100).is_empty());
        assert_eq!(bench.engine.state(), SystemState::Idle);
        assert!(bench.engine.queue().is_empty());
    }

    #[test]
    fn test_wait_timeout_skips() {
        let mut bench = Bench::new(ProtocolConfig::legacy(), timeouts(TimeoutStrategy::SkipContinue, 100));
        bench.submit("WAIT;X(1)", 0);
        bench.submit("PLAY", 0);
        bench.tick(0);
        assert_eq!(bench.tick(100), vec!["x;1;1"]);
    }

    #[test]
    fn test_detect_waits_for_every_sensor() {
        let mut bench = Bench::legacy();
        bench.submit("DETECT;X(1)", 0);
        bench.submit("PLAY", 0);
        bench.tick(0);
        assert_eq!(bench.engine.blocked_on(), Some(BlockKind::Detect));
        bench.signals.set(Signal::Sensor(0), true);
        assert!(bench.tick(100).is_empty());
        bench.signals.set(Signal::Sensor(1), true);
        assert!(bench.tick(200).is_empty());
        assert!(bench.tick(1100).is_empty());
        assert_eq!(bench.tick(1200), vec!["x;1;1"]);
    }

    #[test]
    fn test_set_drives_the_sync_output() {
        let mut bench = Bench::legacy();
        bench.submit("SET(1);X(1);SET(0)", 0);
        bench.submit("PLAY", 0);
        bench.tick(1);
        assert!(bench.signals.get(Signal::SyncOut));
        bench.complete(&["x"], 2);
        bench.tick(3);
        assert!(!bench.signals.get(Signal::SyncOut));
    }

    #[test]
    fn test_queued_system_word_pauses() {
        let mut bench = Bench::legacy();
        bench.submit("X(1);PAUSE;Y(2)", 0);
        bench.submit("PLAY", 0);
        bench.tick(1);
        bench.complete(&["x"], 2);
        assert!(bench.tick(3).is_empty());
        assert_eq!(bench.engine.state(), SystemState::Paused);
    }

    #[test]
    fn test_total_grows_during_a_run() {
        let mut bench = Bench::legacy();
        bench.submit("X(1)", 0);
        bench.submit("PLAY", 1);
        bench.tick(2);
        bench.submit("Y(2)", 300);
        assert_eq!(bench.engine.info().total_commands, 2);
        assert_eq!(bench.engine.info().current_command, 1);
        assert!(bench.engine.info().started_at.is_some());
    }

    #[test]
    fn test_admin_and_status() {
        let mut bench = Bench::legacy();
        assert_eq!(bench.submit("TIMEOUT;STRATEGY;1", 0), Intake::Admin);
        assert_eq!(bench.engine.policy().config().strategy, TimeoutStrategy::PauseSystem);
        assert!(matches!(bench.submit("TIMEOUT;STRATEGY;9", 1), Intake::Refused(_)));
        assert!(matches!(bench.submit("TIMEOUT;NOPE", 2), Intake::Refused(_)));
        assert_eq!(bench.submit("status", 3), Intake::Status);
        let json = serde_json::to_value(bench.engine.status()).unwrap();
        assert_eq!(json["state"], "IDLE");
        assert_eq!(json["timeouts"]["config"]["strategy"], 1);
    }

    #[test]
    fn test_signal_completion() {
        let mut bench = Bench::with_detector(
            ProtocolConfig::legacy(),
            Default::default(),
            Box::new(SignalCompletion::new()),
        );
        bench.submit("X(1);Y(2)", 0);
        bench.submit("PLAY", 0);
        assert_eq!(bench.tick(1), vec!["x;1;1"]);
        assert!(bench.tick(50).is_empty());
        bench.signals.set(Signal::AllDone, true);
        assert_eq!(bench.tick(100), vec!["y;1;2"]);
    }
}
