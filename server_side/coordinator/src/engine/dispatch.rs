//! Carrying out a single primitive statement.
use std::time::Instant;

use axis_protocol::{AxisId, CommandCode};
use tracing::{info, warn};

use crate::{
    policy::BlockKind,
    protocol::Protocol,
    script::{classify, split_statements, StatementKind, SystemCommand},
    signals::{Signal, SignalIo},
};

/// What issuing a statement started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issued {
    /// Motion sent to these axes; completion has to be awaited.
    Motion(Vec<AxisId>),
    /// Applied immediately, nothing to wait for.
    Configured,
    Block(BlockKind),
    System(SystemCommand),
    /// Needs the interpreter: several statements, a call or a definition.
    Nested,
    Skipped,
}

pub struct Dispatcher {
    protocol: Protocol,
    signals: Box<dyn SignalIo>,
}

impl Dispatcher {
    pub fn new(protocol: Protocol, signals: Box<dyn SignalIo>) -> Self {
        Dispatcher { protocol, signals }
    }
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }
    pub fn protocol_mut(&mut self) -> &mut Protocol {
        &mut self.protocol
    }
    pub fn signals_mut(&mut self) -> &mut dyn SignalIo {
        self.signals.as_mut()
    }

    pub fn issue(&mut self, text: &str, now: Instant) -> Issued {
        let statements = split_statements(text);
        let statement = match statements.as_slice() {
            [] => return Issued::Skipped,
            [single] => single.as_str(),
            _ => return Issued::Nested,
        };
        match classify(statement) {
            StatementKind::Zero => {
                info!("zeroing all axes");
                motion(self.protocol.send_broadcast(CommandCode::Zero, None))
            }
            StatementKind::Move(_) => motion(self.protocol.send_coordinate(statement, CommandCode::Run)),
            StatementKind::Group(_) => motion(self.protocol.send_group(statement)),
            StatementKind::Speed { .. } => {
                if self.protocol.send_speed(statement, now) == 0 {
                    Issued::Skipped
                } else {
                    Issued::Configured
                }
            }
            StatementKind::Set(level) => {
                info!("sync output -> {}", u8::from(level));
                self.signals.write(Signal::SyncOut, level);
                Issued::Configured
            }
            StatementKind::Wait => Issued::Block(BlockKind::Wait),
            StatementKind::Detect => Issued::Block(BlockKind::Detect),
            StatementKind::System(command) => Issued::System(command),
            StatementKind::Call(_) | StatementKind::Function { .. } => Issued::Nested,
            StatementKind::Malformed(reason) => {
                warn!("discarding {:?}: {}", statement, reason);
                Issued::Skipped
            }
            StatementKind::Unknown => {
                warn!("discarding unrecognized statement {:?}", statement);
                Issued::Skipped
            }
        }
    }
}

fn motion(axes: Vec<AxisId>) -> Issued {
    if axes.is_empty() {
        Issued::Skipped
    } else {
        Issued::Motion(axes)
    }
}
