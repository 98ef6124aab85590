//! The motion script language.
//!
//! A script is a `;` separated list of statements. `FUNC(name){...}` defines a
//! reusable block and `CALL(name)` inlines it. Definitions are collected first,
//! then the remaining statements are walked in order and every primitive
//! statement is handed to a sink: the queue when parsing, the dispatcher when
//! running in direct mode. Both modes share [`Interpreter::parse`], so they
//! see the same statement sequence.
pub mod statement;
pub mod tokenizer;

use std::{cell::Cell, collections::HashMap, rc::Rc};

use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub use statement::{classify, MotionTerm, StatementKind, SystemCommand};
pub use tokenizer::{find_matching, split_statements, split_top_level};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("another script is still being processed")]
    Busy,
    #[error("function definition is not closed: {0:?}")]
    UnbalancedFunction(String),
    #[error("function {0:?} is already defined; keeping the first definition")]
    DuplicateFunction(String),
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("function {0:?} calls itself")]
    RecursiveCall(String),
    #[error("malformed statement {statement:?}: {reason}")]
    Malformed { statement: String, reason: String },
    #[error("unknown statement {0:?}")]
    UnknownStatement(String),
}

/// A primitive statement produced by expanding a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandedStatement {
    pub text: String,
    /// Innermost function this statement was inlined from.
    pub function: Option<String>,
    pub depth: usize,
}

impl ExpandedStatement {
    pub fn top_level(text: impl Into<String>) -> Self {
        ExpandedStatement {
            text: text.into(),
            function: None,
            depth: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptReport {
    pub emitted: usize,
    /// Fragments that were skipped; each one was also logged.
    pub problems: Vec<ScriptError>,
}

impl ScriptReport {
    fn problem(&mut self, error: ScriptError) {
        warn!("{}", error);
        self.problems.push(error);
    }
}

/// Held while a script is being processed; dropping it releases the interpreter.
#[derive(Debug)]
pub struct ScriptGuard(Rc<Cell<bool>>);

impl Drop for ScriptGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[derive(Debug, Default)]
pub struct Interpreter {
    functions: HashMap<String, String>,
    processing: Rc<Cell<bool>>,
}

impl Interpreter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn guard(&self) -> Result<ScriptGuard, ScriptError> {
        if self.processing.replace(true) {
            warn!("rejecting script: another one is still being processed");
            return Err(ScriptError::Busy);
        }
        Ok(ScriptGuard(self.processing.clone()))
    }
    pub fn is_processing(&self) -> bool {
        self.processing.get()
    }
    pub fn function_names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).sorted_unstable().collect()
    }

    /// Processes a fresh script: functions from the previous one are forgotten.
    pub fn parse(
        &mut self,
        script: &str,
        sink: &mut dyn FnMut(ExpandedStatement),
    ) -> Result<ScriptReport, ScriptError> {
        let _guard = self.guard()?;
        self.functions.clear();
        Ok(self.process(script, sink))
    }

    /// Like [`Interpreter::parse`], but keeps the functions already registered.
    /// Used for queue entries that still contain calls or definitions.
    pub fn expand_nested(
        &mut self,
        script: &str,
        sink: &mut dyn FnMut(ExpandedStatement),
    ) -> Result<ScriptReport, ScriptError> {
        let _guard = self.guard()?;
        Ok(self.process(script, sink))
    }

    pub fn expand(&mut self, script: &str) -> Result<(Vec<ExpandedStatement>, ScriptReport), ScriptError> {
        let mut statements = Vec::new();
        let report = self.parse(script, &mut |statement| statements.push(statement))?;
        Ok((statements, report))
    }

    fn process(&mut self, script: &str, sink: &mut dyn FnMut(ExpandedStatement)) -> ScriptReport {
        let mut report = ScriptReport::default();
        let program = self.register_functions(split_statements(script), &mut report);
        let mut stack = Vec::new();
        self.walk(&program, &mut stack, sink, &mut report);
        report
    }

    fn register_functions(&mut self, statements: Vec<String>, report: &mut ScriptReport) -> Vec<String> {
        let mut program = Vec::with_capacity(statements.len());
        for text in statements {
            match classify(&text) {
                StatementKind::Function { name, body } => {
                    if self.functions.contains_key(&name) {
                        report.problem(ScriptError::DuplicateFunction(name));
                    } else {
                        self.functions.insert(name, body);
                    }
                }
                StatementKind::Malformed(_) if statement::is_function_definition(&text) => {
                    report.problem(ScriptError::UnbalancedFunction(text));
                }
                _ => program.push(text),
            }
        }
        program
    }

    fn walk<'a>(
        &'a self,
        statements: &[String],
        stack: &mut Vec<&'a str>,
        sink: &mut dyn FnMut(ExpandedStatement),
        report: &mut ScriptReport,
    ) {
        for text in statements {
            match classify(text) {
                StatementKind::Call(called) => {
                    let Some((name, body)) = self.functions.get_key_value(called.as_str()) else {
                        report.problem(ScriptError::UnknownFunction(called));
                        continue;
                    };
                    if stack.contains(&name.as_str()) {
                        report.problem(ScriptError::RecursiveCall(called));
                        continue;
                    }
                    stack.push(name.as_str());
                    self.walk(&split_statements(body), stack, sink, report);
                    stack.pop();
                }
                StatementKind::Function { .. } => report.problem(ScriptError::Malformed {
                    statement: text.clone(),
                    reason: "functions can only be defined at the top level".to_string(),
                }),
                StatementKind::Malformed(reason) => report.problem(ScriptError::Malformed {
                    statement: text.clone(),
                    reason,
                }),
                StatementKind::Unknown => report.problem(ScriptError::UnknownStatement(text.clone())),
                _ => {
                    report.emitted += 1;
                    sink(ExpandedStatement {
                        text: text.clone(),
                        function: stack.last().map(|name| name.to_string()),
                        depth: stack.len(),
                    });
                }
            }
        }
    }
}
