use crate::command::{Command, CommandFactory, Dispatch, ExitCode, Pipeline, Statement};
use crate::config::Limits;
use crate::env::Environment;
use crate::executor::{Stragglers, WaitMode, run_pipeline};
use crate::parser::parse_line;
use anyhow::Context;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use tracing::{debug, warn};

const ANSI_PROMPT: &str = "\x1b[0;33m";
const ANSI_CWD: &str = "\x1b[0;35m";
const ANSI_RESET: &str = "\x1b[0m";

/// Factory allows creating instances of ExecutableCommand.
///
/// Only supports the builtins defined in this crate.
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

/// An interactive shell: parses lines into statements and runs them one by one.
///
/// Single-command statements are first offered to the builtin table; everything
/// else is forked and executed as a pipeline.
///
/// Example
/// ```no_run
/// use tiny_shell::Shell;
/// let mut sh = Shell::default();
/// let status = sh.execute_line("ls -l | wc -l > count.txt ; cat count.txt");
/// assert_eq!(status, 0);
/// ```
pub struct Shell {
    env: Environment,
    builtins: Vec<Box<dyn CommandFactory>>,
    limits: Limits,
    wait: WaitMode,
    stragglers: Stragglers,
}

impl Shell {
    /// Create a new shell with a custom set of builtins and limits.
    pub fn new(builtins: Vec<Box<dyn CommandFactory>>, limits: Limits) -> Self {
        Self {
            env: Environment::new(),
            builtins,
            limits,
            wait: WaitMode::Block,
            stragglers: Stragglers::default(),
        }
    }

    /// Create a shell with the default builtins and the given limits.
    pub fn with_limits(limits: Limits) -> Self {
        Self::new(crate::builtin::defaults(), limits)
    }

    /// Choose whether the shell blocks on each pipeline or only polls it once.
    pub fn with_wait_mode(mut self, wait: WaitMode) -> Self {
        self.wait = wait;
        self
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Whether a builtin asked the session to end, and with which status.
    pub fn exit_requested(&self) -> Option<ExitCode> {
        self.env.exit_requested
    }

    /// Offer a command to the builtin table.
    ///
    /// On a match the builtin runs in-process and its output goes to `stdout`.
    pub fn try_builtin(&mut self, command: &Command, stdout: &mut dyn Write) -> Dispatch {
        let args: Vec<&str> = command.args().iter().map(String::as_str).collect();
        let Some(builtin) = self
            .builtins
            .iter()
            .find_map(|factory| factory.try_create(command.name(), &args))
        else {
            return Dispatch::NotABuiltin;
        };
        debug!(name = command.name(), "running builtin");
        match builtin.execute(stdout, &mut self.env) {
            Ok(code) => Dispatch::RanAsBuiltin(code),
            Err(e) => {
                eprintln!("{}: {e:#}", command.name());
                Dispatch::RanAsBuiltin(1)
            }
        }
    }

    /// Run one statement's pipeline to completion and return its status.
    fn run_statement(&mut self, pipeline: &Pipeline) -> ExitCode {
        if let Some(command) = pipeline.single() {
            let mut stdout = io::stdout();
            if let Dispatch::RanAsBuiltin(code) = self.try_builtin(command, &mut stdout) {
                if pipeline.input.is_some() || pipeline.output.is_some() {
                    debug!(name = command.name(), "redirection ignored for builtin");
                }
                let _ = stdout.flush();
                return code;
            }
        }
        // Anything buffered must reach the terminal before children write to it.
        let _ = io::stdout().flush();
        match run_pipeline(pipeline, self.wait, &mut self.stragglers) {
            Ok(code) => {
                if code != 0 {
                    debug!(code, "pipeline exited with non-zero status");
                }
                code
            }
            Err(e) => {
                eprintln!("{e}");
                1
            }
        }
    }

    /// Parse and run one input line, returning the status of the last statement run.
    ///
    /// A syntax error anywhere on the line runs nothing and yields 1. Statements
    /// that broke a limit are reported and skipped; the others still run, strictly
    /// one after the other. An `exit` stops the line after its own statement.
    pub fn execute_line(&mut self, line: &str) -> ExitCode {
        self.stragglers.reap();
        let line = line.trim_end_matches(['\n', '\r']);
        let sequence = match parse_line(line, &self.limits) {
            Ok(sequence) => sequence,
            Err(e) => {
                eprintln!("{e}");
                return 1;
            }
        };

        let mut status = 0;
        for statement in &sequence.statements {
            status = match statement {
                Statement::Ready(pipeline) => self.run_statement(pipeline),
                Statement::Discarded(e) => {
                    warn!(error = %e, "statement discarded");
                    eprintln!("{e}");
                    1
                }
            };
            if self.env.should_exit() {
                break;
            }
        }
        status
    }

    fn prompt(&self) -> String {
        format!(
            "{ANSI_PROMPT}tiny_shell{ANSI_RESET}@{ANSI_CWD}{}{ANSI_RESET}$ ",
            self.env.current_dir.display()
        )
    }

    /// Read-eval loop: prompt, read a line, run it, until EOF or `exit`.
    ///
    /// Returns the status requested by `exit`, or the last line's status on EOF.
    pub fn repl(&mut self) -> anyhow::Result<ExitCode> {
        let mut rl = DefaultEditor::new().context("failed to initialise line editor")?;
        let mut status = 0;

        while !self.env.should_exit() {
            match rl.readline(&self.prompt()) {
                Ok(line) => status = self.execute_line(&line),
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err).context("failed to read input line"),
            }
        }

        Ok(self.env.exit_requested.unwrap_or(status))
    }
}

impl Default for Shell {
    /// Create a shell with the default builtins (`exit`, `cd`, `cwd`, `ver`)
    /// and default limits.
    fn default() -> Self {
        Self::with_limits(Limits::default())
    }
}
