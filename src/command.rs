use crate::env::Environment;
use crate::parser::LimitError;
use anyhow::Result;
use std::io::Write;
use std::path::PathBuf;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// One stage of a pipeline: the program name followed by its arguments.
///
/// Never empty. The parser only builds a `Command` once it has read at least
/// one token, and the executor relies on `argv[0]` being present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    argv: Vec<String>,
}

impl Command {
    /// Build a command from its argument vector, or `None` when it is empty.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(Self { argv })
        }
    }

    /// Program name, i.e. the first token.
    pub fn name(&self) -> &str {
        &self.argv[0]
    }

    /// Every token after the program name.
    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    /// The full argument vector, program name included.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

/// How an output redirection treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// `>`: overwrite the file.
    Truncate,
    /// `>>`: write after the existing contents.
    Append,
}

/// Destination of the last stage's standard output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub path: PathBuf,
    pub mode: OutputMode,
}

/// Commands joined by `|`, with optional file redirections at its two ends.
///
/// `input` only ever applies to the first command and `output` to the last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub commands: Vec<Command>,
    pub input: Option<PathBuf>,
    pub output: Option<OutputTarget>,
}

impl Pipeline {
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            commands,
            input: None,
            output: None,
        }
    }

    /// The single command of a pipeline without pipes, if that is what this is.
    pub fn single(&self) -> Option<&Command> {
        match self.commands.as_slice() {
            [command] => Some(command),
            _ => None,
        }
    }
}

/// One `;`-separated piece of an input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// A well-formed pipeline ready to run.
    Ready(Pipeline),
    /// A statement that broke a limit; it is reported and never run.
    Discarded(LimitError),
}

/// Every statement parsed from one input line, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSequence {
    pub statements: Vec<Statement>,
}

/// Outcome of offering a command to the builtin table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The name matched a builtin, which ran in-process with this status.
    RanAsBuiltin(ExitCode),
    /// No builtin has this name; the caller should fork and exec it.
    NotABuiltin,
}

/// Object-safe trait for a command that runs inside the shell process.
pub trait ExecutableCommand {
    /// Executes the command.
    fn execute(self: Box<Self>, stdout: &mut dyn Write, env: &mut Environment)
    -> Result<ExitCode>;
}

/// Factory that tries to create a command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize the `name`.
pub trait CommandFactory {
    /// Attempt to create a command instance for the provided name and arguments.
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>>;
}
