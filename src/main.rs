use anyhow::{Result, bail};
use argh::FromArgs;
use std::process::ExitCode;
use tiny_shell::Shell;
use tiny_shell::config::Limits;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(FromArgs)]
/// A tiny shell with pipes, redirection and `;`-separated statements.
struct Cli {
    /// run a single line and exit with its status
    #[argh(option, short = 'c')]
    command: Option<String>,

    /// maximum number of statements per line
    #[argh(option, default = "Limits::default().max_statements")]
    max_statements: usize,

    /// maximum number of commands per pipeline
    #[argh(option, default = "Limits::default().max_stages")]
    max_stages: usize,

    /// maximum number of tokens per command, program name included
    #[argh(option, default = "Limits::default().max_args")]
    max_args: usize,

    /// maximum length of one argument, in bytes
    #[argh(option, default = "Limits::default().max_token_len")]
    max_token_len: usize,

    /// maximum length of a redirection path, in bytes
    #[argh(option, default = "Limits::default().max_path_len")]
    max_path_len: usize,

    /// maximum length of an input line, in bytes
    #[argh(option, default = "Limits::default().max_line_len")]
    max_line_len: usize,
}

impl Cli {
    fn limits(&self) -> Result<Limits> {
        let limits = [
            ("--max-statements", self.max_statements),
            ("--max-stages", self.max_stages),
            ("--max-args", self.max_args),
            ("--max-token-len", self.max_token_len),
            ("--max-path-len", self.max_path_len),
            ("--max-line-len", self.max_line_len),
        ];
        if let Some((flag, _)) = limits.iter().find(|(_, value)| *value == 0) {
            bail!("{flag} must be at least 1");
        }
        Ok(Limits {
            max_statements: self.max_statements,
            max_stages: self.max_stages,
            max_args: self.max_args,
            max_token_len: self.max_token_len,
            max_path_len: self.max_path_len,
            max_line_len: self.max_line_len,
        })
    }
}

fn main() -> ExitCode {
    // Silent unless RUST_LOG is set; stderr keeps stdout clean for pipelines.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli: Cli = argh::from_env();
    match run(cli) {
        Ok(code) => ExitCode::from((code & 0xff) as u8),
        Err(e) => {
            eprintln!("tiny_shell: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut shell = Shell::with_limits(cli.limits()?);
    match cli.command {
        Some(line) => Ok(shell.execute_line(&line)),
        None => shell.repl(),
    }
}
