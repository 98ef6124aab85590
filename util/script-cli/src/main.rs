use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_stdin::FileOrStdin;
use coordinator::{
    engine::{Dispatcher, Issued},
    protocol::{Protocol, ProtocolConfig},
    script::{ExpandedStatement, Interpreter},
    signals::MemorySignals,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect what the coordinator makes of a motion script.", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the queue entries a script expands into.
    Expand {
        /// The script to read, or - for stdin.
        #[arg()]
        script: FileOrStdin,
        #[arg(long)]
        json: bool,
    },
    /// Print the bus lines every queue entry produces.
    Wire {
        #[arg()]
        script: FileOrStdin,
        /// One line per command instead of checksummed frames.
        #[arg(long)]
        legacy: bool,
        #[arg(long, default_value_t = 8)]
        batch_size: usize,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct WireEntry {
    statement: String,
    lines: Vec<String>,
    commands: usize,
}

fn expand(script: &str) -> anyhow::Result<Vec<ExpandedStatement>> {
    let mut interpreter = Interpreter::new();
    let (statements, report) = interpreter.expand(script)?;
    for problem in &report.problems {
        eprintln!("skipped: {}", problem);
    }
    Ok(statements)
}

fn wire(statements: &[ExpandedStatement], config: ProtocolConfig) -> anyhow::Result<Vec<WireEntry>> {
    let mut dispatcher = Dispatcher::new(Protocol::new(config), Box::new(MemorySignals::new(0)));
    let now = Instant::now();
    statements
        .iter()
        .map(|statement| {
            let issued = dispatcher.issue(&statement.text, now);
            dispatcher.protocol_mut().flush();
            let lines = dispatcher.protocol_mut().take_outgoing();
            let mut commands = 0;
            for line in &lines {
                commands += axis_protocol::decode_line(line)
                    .with_context(|| format!("{:?} produced an undecodable line {:?}", statement.text, line))?
                    .len();
            }
            if let Issued::Block(kind) = issued {
                eprintln!("{} blocks until {} resolves", statement.text, kind);
            }
            Ok(WireEntry {
                statement: statement.text.clone(),
                lines,
                commands,
            })
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Expand { script, json } => {
            let statements = expand(&script)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statements)?);
            } else {
                for statement in statements {
                    let indent = "  ".repeat(statement.depth);
                    match statement.function {
                        Some(function) => println!("{}{}    ({})", indent, statement.text, function),
                        None => println!("{}{}", indent, statement.text),
                    }
                }
            }
        }
        Command::Wire {
            script,
            legacy,
            batch_size,
            json,
        } => {
            let config = ProtocolConfig {
                batching: !legacy,
                batch_size,
                ..Default::default()
            };
            let entries = wire(&expand(&script)?, config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!("{}", entry.statement);
                    for line in entry.lines {
                        println!("    {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}
