use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::env::Environment;
use crate::interpreter::Factory;
use anyhow::{Result, anyhow};
use argh::{EarlyExit, FromArgs};
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const ANSI_TITLE: &str = "\x1b[0;33m";
const ANSI_QUOTE: &str = "\x1b[0;33m";
const ANSI_RESET: &str = "\x1b[0m";

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process without spawning a child process.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "cd".
    fn name() -> &'static str;

    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(self, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(
        self: Box<Self>,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        match T::execute(*self, stdout, env) {
            Ok(x) => Ok(x),
            Err(e) => {
                eprintln!("{e}");
                Ok(1)
            }
        }
    }
}

/// What a builtin does when argh refuses its arguments (or `--help` was asked for).
struct InvalidArgs {
    output: String,
    is_error: bool,
}

impl ExecutableCommand for InvalidArgs {
    fn execute(
        self: Box<Self>,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.is_error {
            eprintln!("{}", self.output);
            Ok(1)
        } else {
            writeln!(stdout, "{}", self.output)?;
            Ok(0)
        }
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>> {
        if name != T::name() {
            return None;
        }
        Some(match T::from_args(&[name], args) {
            Ok(cmd) => Box::new(cmd),
            Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                output,
                is_error: status.is_err(),
            }),
        })
    }
}

/// The builtins every shell starts with: `exit`, `cd`, `cwd` and `ver`.
pub(crate) fn defaults() -> Vec<Box<dyn CommandFactory>> {
    vec![
        Box::new(Factory::<Exit>::default()),
        Box::new(Factory::<Cd>::default()),
        Box::new(Factory::<Cwd>::default()),
        Box::new(Factory::<Ver>::default()),
    ]
}

#[derive(FromArgs)]
/// Leave the shell once the current statement is done.
pub struct Exit {
    #[argh(positional)]
    /// status to exit with; defaults to 0.
    pub code: Option<ExitCode>,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn execute(self, _stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        let code = self.code.unwrap_or(0);
        env.exit_requested = Some(code);
        Ok(code)
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// Without a target, or with `~`, changes to the directory named by HOME.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn execute(self, _stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        let target = match self.target.as_deref() {
            None | Some("") | Some("~") => match env.get_var("HOME") {
                Some(home) => PathBuf::from(home),
                None => return Err(anyhow!("cd: HOME not set")),
            },
            Some(t) => PathBuf::from(t),
        };

        let new_dir = if target.is_absolute() {
            target.clone()
        } else {
            env.current_dir.join(&target)
        };

        let canonical = fs::canonicalize(&new_dir)
            .and_then(|dir| env::set_current_dir(&dir).map(|()| dir))
            .map_err(|_| anyhow!("cd: {}: No such file or directory", target.display()))?;
        env.current_dir = canonical;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Cwd {}

impl BuiltinCommand for Cwd {
    fn name() -> &'static str {
        "cwd"
    }

    fn execute(self, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        writeln!(stdout, "{}", env.current_dir.display())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Print the shell's name and version.
pub struct Ver {}

impl BuiltinCommand for Ver {
    fn name() -> &'static str {
        "ver"
    }

    fn execute(self, stdout: &mut dyn Write, _env: &mut Environment) -> Result<ExitCode> {
        const WIDTH: usize = 38;
        let title = " TINY SHELL ";
        let side = "-".repeat((WIDTH - title.len() - 2) / 2);
        writeln!(stdout, "@{side}@{ANSI_TITLE}{title}{ANSI_RESET}@{side}@")?;
        let rows = [
            ("Name:", env!("CARGO_PKG_NAME")),
            ("Version:", env!("CARGO_PKG_VERSION")),
        ];
        for (label, value) in rows {
            writeln!(stdout, "| {label:<18}{value:>18} |")?;
        }
        writeln!(stdout, "|{:WIDTH$}|", "")?;
        for line in [
            "Pipes, redirection and ; sequences.",
            "Nothing more, nothing less.",
        ] {
            writeln!(stdout, "|{ANSI_QUOTE} {line:<37}{ANSI_RESET}|")?;
        }
        writeln!(stdout, "@{}@", "-".repeat(WIDTH))?;
        Ok(0)
    }
}
