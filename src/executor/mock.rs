use std::cell::RefCell;
use std::io;

use super::{CommandSpec, ExecResult, Executor};
use crate::identity::Identity;

type Responder = Box<dyn Fn(&CommandSpec) -> io::Result<ExecResult>>;

/// Executor that records invocations and answers from a responder closure.
pub(crate) struct ScriptedExecutor {
    calls: RefCell<Vec<CommandSpec>>,
    responder: Responder,
}

impl ScriptedExecutor {
    /// Every command succeeds with empty output.
    pub(crate) fn succeeding() -> Self {
        Self::with(|_| Ok(ok("")))
    }

    pub(crate) fn with(responder: impl Fn(&CommandSpec) -> io::Result<ExecResult> + 'static) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    /// Recorded invocations rendered as `program arg arg`.
    pub(crate) fn command_lines(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|spec| {
                std::iter::once(spec.program.as_str())
                    .chain(spec.args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }
}

impl Executor for ScriptedExecutor {
    fn run(&self, spec: &CommandSpec, _identity: &Identity) -> io::Result<ExecResult> {
        self.calls.borrow_mut().push(spec.clone());
        (self.responder)(spec)
    }
}

pub(crate) fn ok(stdout: &str) -> ExecResult {
    ExecResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn failed(code: i32, stderr: &str) -> ExecResult {
    ExecResult {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}
