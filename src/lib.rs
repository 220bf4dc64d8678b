//! A tiny interactive shell.
//!
//! One input line is scanned into `;`-separated statements, each a pipeline of
//! commands joined by `|` with optional `<`, `>` and `>>` redirections at its
//! ends. Single commands are first offered to a small table of builtins; all
//! other pipelines run as one forked process per stage, wired together with
//! pipes.
//!
//! The main entry point is [`Shell`]. The [`parser`] and [`executor`] modules
//! can also be used on their own: [`parser::parse_line`] turns text into a
//! [`command::CommandSequence`] without running anything, and
//! [`executor::run_pipeline`] runs one [`command::Pipeline`].

mod builtin;
pub mod command;
pub mod config;
pub mod env;
pub mod executor;
mod interpreter;
pub mod parser;
pub mod redirect;

/// The interactive shell.
///
/// See [`Shell`] for the high-level API.
pub use interpreter::Shell;
