//! Turns statements into bus traffic.
//!
//! In legacy mode every command goes out as its own line. In batched mode
//! commands accumulate in one open batch that is flushed when it is full or
//! when its oldest command has waited for the batch timeout. Groups and
//! coordinate moves are always flushed together so the receiving axes act on
//! them at the same time.
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use axis_protocol::{encode_frame, AxisId, CommandCode, SlaveCommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::script::statement::{parse_group, parse_motion, parse_speed, MotionTerm};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub batching: bool,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            batching: true,
            batch_size: 8,
            batch_timeout: Duration::from_millis(20),
        }
    }
}

impl ProtocolConfig {
    pub fn legacy() -> Self {
        ProtocolConfig {
            batching: false,
            ..Default::default()
        }
    }
}

struct OpenBatch {
    commands: Vec<SlaveCommand>,
    opened_at: Instant,
}

pub struct Protocol {
    config: ProtocolConfig,
    open: Option<OpenBatch>,
    outgoing: VecDeque<String>,
}

fn resolve_target(target: &str) -> Option<AxisId> {
    let resolved = AxisId::parse(target);
    if resolved.is_none() {
        warn!("dropping command for unknown target {:?}", target);
    }
    resolved
}

fn commands_for(terms: &[MotionTerm], code: CommandCode) -> Vec<SlaveCommand> {
    terms
        .iter()
        .filter_map(|term| {
            resolve_target(&term.target).map(|target| SlaveCommand::new(target, code, term.params()))
        })
        .collect()
}

impl Protocol {
    pub fn new(config: ProtocolConfig) -> Self {
        Protocol {
            config: ProtocolConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
            open: None,
            outgoing: VecDeque::new(),
        }
    }
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Queues one command for `target`; returns whether the target was valid.
    pub fn send_single(&mut self, target: &str, code: CommandCode, params: Option<&str>, now: Instant) -> bool {
        match resolve_target(target) {
            Some(target) => {
                self.push(SlaveCommand::new(target, code, params.map(str::to_string)), now);
                true
            }
            None => false,
        }
    }

    /// Sends `code` to every axis in one unit. Returns the axes addressed.
    pub fn send_broadcast(&mut self, code: CommandCode, params: Option<&str>) -> Vec<AxisId> {
        let commands: Vec<_> = AxisId::ALL
            .iter()
            .map(|&target| SlaveCommand::new(target, code, params.map(str::to_string)))
            .collect();
        self.push_together(commands)
    }

    /// `GROUP(target(params), ...)`: every valid sub-command lands in one packet.
    pub fn send_group(&mut self, text: &str) -> Vec<AxisId> {
        match parse_group(text) {
            Some(terms) => self.push_together(commands_for(&terms, CommandCode::Group)),
            None => {
                warn!("malformed group {:?}", text);
                Vec::new()
            }
        }
    }

    /// `X(100)` or `X(100)Y(50)`: one command per axis term, sent together.
    pub fn send_coordinate(&mut self, text: &str, code: CommandCode) -> Vec<AxisId> {
        match parse_motion(text) {
            Some(terms) => self.push_together(commands_for(&terms, code)),
            None => {
                warn!("malformed coordinate move {:?}", text);
                Vec::new()
            }
        }
    }

    /// `SPEED;v` sets every axis; `SPEED;axis;v` sets one.
    pub fn send_speed(&mut self, text: &str, now: Instant) -> usize {
        match parse_speed(text) {
            Some((None, value)) => {
                for target in AxisId::ALL {
                    self.push(SlaveCommand::new(target, CommandCode::SetSpeed, Some(value.clone())), now);
                }
                AxisId::ALL.len()
            }
            Some((Some(axis), value)) => {
                usize::from(self.send_single(&axis, CommandCode::SetSpeed, Some(&value), now))
            }
            None => {
                warn!("malformed speed command {:?}", text);
                0
            }
        }
    }

    fn push(&mut self, command: SlaveCommand, now: Instant) {
        if !self.config.batching {
            self.emit(&[command]);
            return;
        }
        let batch = self.open.get_or_insert_with(|| OpenBatch {
            commands: Vec::new(),
            opened_at: now,
        });
        batch.commands.push(command);
        if batch.commands.len() >= self.config.batch_size {
            self.flush();
        }
    }

    fn push_together(&mut self, commands: Vec<SlaveCommand>) -> Vec<AxisId> {
        let targets: Vec<AxisId> = commands.iter().map(|command| command.target).collect();
        let count = commands.len();
        if count == 0 {
            return targets;
        }
        if !self.config.batching {
            for command in commands {
                self.emit(&[command]);
            }
            return targets;
        }
        let buffered = self.open.as_ref().map_or(0, |batch| batch.commands.len());
        if buffered + count > self.config.batch_size {
            self.flush();
        }
        match &mut self.open {
            Some(batch) => {
                batch.commands.extend(commands);
                self.flush();
            }
            // May exceed the batch size: a group is never split across packets.
            None => self.emit(&commands),
        }
        targets
    }

    fn emit(&mut self, commands: &[SlaveCommand]) {
        if let Some(line) = encode_frame(commands) {
            debug!("bus <- {}", line);
            self.outgoing.push_back(line);
        }
    }

    /// Sends the open batch, if any.
    pub fn flush(&mut self) {
        if let Some(batch) = self.open.take() {
            self.emit(&batch.commands);
        }
    }

    /// When the open batch has to go out by.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.open
            .as_ref()
            .map(|batch| batch.opened_at + self.config.batch_timeout)
    }

    pub fn poll(&mut self, now: Instant) {
        if matches!(self.flush_deadline(), Some(deadline) if now >= deadline) {
            self.flush();
        }
    }

    pub fn has_open_batch(&self) -> bool {
        self.open.is_some()
    }

    /// Lines ready for the bus, oldest first, without newlines.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        self.outgoing.drain(..).collect()
    }
}
