use crate::command::{Command, CommandSequence, OutputMode, OutputTarget, Pipeline, Statement};
use crate::config::Limits;
use std::iter::Peekable;
use std::mem;
use std::path::PathBuf;
use std::str::Chars;
use thiserror::Error;
use tracing::debug;

/// Problems that make a whole input line unusable. Nothing on the line runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    /// A metacharacter in a position where it cannot appear.
    #[error("Syntax error near unexpected token [{0}]")]
    UnexpectedToken(String),
    /// The line ended inside a `"` quote.
    #[error("Syntax error: mismatched quotes")]
    MismatchedQuotes,
    #[error("Input line too long ({len} > {max} characters)")]
    LineTooLong { len: usize, max: usize },
}

/// A statement that broke one of the configured [`Limits`].
///
/// Only the offending statement is dropped; the rest of the line still runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("Too many pipelines passed to pipeline sequence")]
    TooManyStatements,
    #[error("Too many commands passed in pipeline [{first} ... | {second} ... | ... ]")]
    TooManyStages { first: String, second: String },
    #[error("Too many arguments passed to command [{command}]")]
    TooManyArguments { command: String },
    #[error("Too many characters passed to argument [{prefix}...]")]
    ArgumentTooLong { prefix: String },
    #[error("Too many characters passed to file path [{prefix}...]")]
    PathTooLong { prefix: String },
}

enum Fault {
    Syntax(SyntaxError),
    Limit(LimitError),
}

impl From<SyntaxError> for Fault {
    fn from(e: SyntaxError) -> Self {
        Fault::Syntax(e)
    }
}

impl From<LimitError> for Fault {
    fn from(e: LimitError) -> Self {
        Fault::Limit(e)
    }
}

type Step = Result<(), Fault>;

fn unexpected(token: &str) -> Fault {
    Fault::Syntax(SyntaxError::UnexpectedToken(token.to_string()))
}

/// Where ordinary characters currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Argument,
    OutputPath,
    InputPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading arguments; metacharacters are live.
    Normal,
    /// Between a pair of `"`; the field says where the text goes and where to return.
    InQuote(Field),
    /// After `>` or `>>`, collecting the file name.
    AwaitingOutputPath,
    /// After `<`, collecting the file name.
    AwaitingInputPath,
    /// Dropping the rest of a statement that broke a limit, up to the next `;`.
    Skipping { quoted: bool },
}

impl State {
    fn resume(field: Field) -> State {
        match field {
            Field::Argument => State::Normal,
            Field::OutputPath => State::AwaitingOutputPath,
            Field::InputPath => State::AwaitingInputPath,
        }
    }
}

/// Everything collected for the statement currently being scanned.
#[derive(Debug, Default)]
struct Cursor {
    commands: Vec<Command>,
    argv: Vec<String>,
    token: String,
    input: Option<String>,
    output: Option<(String, OutputMode)>,
}

impl Cursor {
    fn is_blank(&self) -> bool {
        self.commands.is_empty()
            && self.argv.is_empty()
            && self.token.is_empty()
            && self.input.is_none()
            && self.output.is_none()
    }

    /// Names of the first two stages, for the too-many-stages diagnostic.
    fn stage_names(&self) -> (String, String) {
        let mut names = self
            .commands
            .iter()
            .map(|c| c.name().to_string())
            .chain(self.argv.first().cloned());
        let first = names.next().unwrap_or_default();
        let second = names.next().unwrap_or_default();
        (first, second)
    }
}

fn prefix(text: &str) -> String {
    text.chars().take(5).collect()
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
    limits: &'a Limits,
    state: State,
    cursor: Cursor,
    sequence: CommandSequence,
}

impl<'a> Parser<'a> {
    fn new(line: &'a str, limits: &'a Limits) -> Self {
        Self {
            chars: line.chars().peekable(),
            limits,
            state: State::Normal,
            cursor: Cursor::default(),
            sequence: CommandSequence::default(),
        }
    }

    fn run(mut self) -> Result<CommandSequence, SyntaxError> {
        while let Some(c) = self.chars.next() {
            let step = match self.state {
                State::Normal => self.normal(c),
                State::InQuote(field) => self.quoted(c, field),
                State::AwaitingOutputPath => self.path(c, Field::OutputPath),
                State::AwaitingInputPath => self.path(c, Field::InputPath),
                State::Skipping { quoted } => {
                    self.skip(c, quoted);
                    Ok(())
                }
            };
            self.settle(step)?;
        }
        let step = self.finish_line();
        self.settle(step)?;
        Ok(self.sequence)
    }

    fn settle(&mut self, step: Step) -> Result<(), SyntaxError> {
        match step {
            Ok(()) => Ok(()),
            Err(Fault::Syntax(e)) => Err(e),
            Err(Fault::Limit(e)) => {
                self.discard(e);
                Ok(())
            }
        }
    }

    fn normal(&mut self, c: char) -> Step {
        match c {
            ' ' => self.end_token(),
            '|' => self.pipe(),
            '>' => {
                if self.chars.peek() == Some(&'>') {
                    self.chars.next();
                    self.redirect_output(OutputMode::Append)
                } else {
                    self.redirect_output(OutputMode::Truncate)
                }
            }
            '<' => self.redirect_input(),
            ';' => self.end_statement(),
            '"' => {
                self.state = State::InQuote(Field::Argument);
                Ok(())
            }
            '\\' => {
                let escaped = self.escaped()?;
                self.push_char(Field::Argument, escaped)
            }
            _ => self.push_char(Field::Argument, c),
        }
    }

    fn quoted(&mut self, c: char, field: Field) -> Step {
        match c {
            '"' => {
                self.state = State::resume(field);
                Ok(())
            }
            '\\' => {
                let escaped = self.escaped()?;
                self.push_char(field, escaped)
            }
            _ => self.push_char(field, c),
        }
    }

    fn path(&mut self, c: char, field: Field) -> Step {
        let started = match field {
            Field::OutputPath => self.cursor.output.as_ref().is_some_and(|(p, _)| !p.is_empty()),
            _ => self.cursor.input.as_ref().is_some_and(|p| !p.is_empty()),
        };
        match c {
            ' ' => {
                if started {
                    self.state = State::Normal;
                }
                Ok(())
            }
            '|' | '>' | '<' | ';' => {
                if !started {
                    return Err(unexpected(&self.meta_token(c)));
                }
                self.state = State::Normal;
                self.normal(c)
            }
            '"' => {
                self.state = State::InQuote(field);
                Ok(())
            }
            '\\' => {
                let escaped = self.escaped()?;
                self.push_char(field, escaped)
            }
            _ => self.push_char(field, c),
        }
    }

    fn skip(&mut self, c: char, quoted: bool) {
        match (c, quoted) {
            ('\\', _) => {
                self.chars.next();
            }
            ('"', q) => self.state = State::Skipping { quoted: !q },
            (';', false) => {
                self.cursor = Cursor::default();
                self.state = State::Normal;
            }
            _ => {}
        }
    }

    /// Spell a metacharacter the way the user typed it, `>>` included.
    fn meta_token(&mut self, c: char) -> String {
        if c == '>' && self.chars.peek() == Some(&'>') {
            ">>".to_string()
        } else {
            c.to_string()
        }
    }

    /// Consume the character after a `\`.
    fn escaped(&mut self) -> Result<char, Fault> {
        self.chars.next().ok_or_else(|| unexpected("\\"))
    }

    fn push_char(&mut self, field: Field, c: char) -> Step {
        let limits = self.limits;
        let cursor = &mut self.cursor;
        match field {
            Field::Argument => {
                if cursor.token.len() + c.len_utf8() > limits.max_token_len {
                    return Err(LimitError::ArgumentTooLong {
                        prefix: prefix(&cursor.token),
                    }
                    .into());
                }
                cursor.token.push(c);
            }
            Field::OutputPath | Field::InputPath => {
                let path = match field {
                    Field::OutputPath => {
                        &mut cursor
                            .output
                            .get_or_insert_with(|| (String::new(), OutputMode::Truncate))
                            .0
                    }
                    _ => cursor.input.get_or_insert_default(),
                };
                if path.len() + c.len_utf8() > limits.max_path_len {
                    return Err(LimitError::PathTooLong {
                        prefix: prefix(path),
                    }
                    .into());
                }
                path.push(c);
            }
        }
        Ok(())
    }

    fn end_token(&mut self) -> Step {
        if self.cursor.token.is_empty() {
            return Ok(());
        }
        if self.cursor.argv.len() >= self.limits.max_args {
            let command = self.cursor.argv.first().unwrap_or(&self.cursor.token);
            return Err(LimitError::TooManyArguments {
                command: command.clone(),
            }
            .into());
        }
        let token = mem::take(&mut self.cursor.token);
        self.cursor.argv.push(token);
        Ok(())
    }

    fn take_command(&mut self) -> Option<Command> {
        Command::new(mem::take(&mut self.cursor.argv))
    }

    fn pipe(&mut self) -> Step {
        self.end_token()?;
        if self.cursor.argv.is_empty() || self.cursor.output.is_some() {
            return Err(unexpected("|"));
        }
        if self.cursor.commands.len() + 2 > self.limits.max_stages {
            let (first, second) = self.cursor.stage_names();
            return Err(LimitError::TooManyStages { first, second }.into());
        }
        if let Some(command) = self.take_command() {
            self.cursor.commands.push(command);
        }
        Ok(())
    }

    fn redirect_output(&mut self, mode: OutputMode) -> Step {
        let token = match mode {
            OutputMode::Truncate => ">",
            OutputMode::Append => ">>",
        };
        self.end_token()?;
        if self.cursor.argv.is_empty() || self.cursor.output.is_some() {
            return Err(unexpected(token));
        }
        self.cursor.output = Some((String::new(), mode));
        self.state = State::AwaitingOutputPath;
        Ok(())
    }

    fn redirect_input(&mut self) -> Step {
        self.end_token()?;
        let cursor = &self.cursor;
        if cursor.argv.is_empty() || !cursor.commands.is_empty() || cursor.input.is_some() {
            return Err(unexpected("<"));
        }
        self.cursor.input = Some(String::new());
        self.state = State::AwaitingInputPath;
        Ok(())
    }

    fn end_statement(&mut self) -> Step {
        match self.end_token() {
            Err(Fault::Limit(e)) => {
                // The `;` is already consumed, so there is nothing left to skip.
                self.discard(e);
                self.state = State::Normal;
                return Ok(());
            }
            step => step?,
        }
        if self.cursor.argv.is_empty() {
            return Err(unexpected(";"));
        }
        self.complete();
        Ok(())
    }

    fn finish_line(&mut self) -> Step {
        let dangling = match self.state {
            State::InQuote(_) | State::Skipping { quoted: true } => {
                return Err(SyntaxError::MismatchedQuotes.into());
            }
            State::Skipping { quoted: false } => return Ok(()),
            State::AwaitingOutputPath => match &self.cursor.output {
                Some((path, OutputMode::Truncate)) if path.is_empty() => Some(">"),
                Some((path, OutputMode::Append)) if path.is_empty() => Some(">>"),
                _ => None,
            },
            State::AwaitingInputPath => match &self.cursor.input {
                Some(path) if path.is_empty() => Some("<"),
                _ => None,
            },
            State::Normal => None,
        };
        match dangling {
            Some(token) => Err(unexpected(token)),
            None => self.finish_statement(),
        }
    }

    fn finish_statement(&mut self) -> Step {
        self.end_token()?;
        if self.cursor.is_blank() {
            // Empty line, or nothing after a trailing `;`.
            return Ok(());
        }
        if self.cursor.argv.is_empty() {
            return Err(unexpected("|"));
        }
        self.complete();
        Ok(())
    }

    /// Turn the cursor into a ready statement and start over.
    fn complete(&mut self) {
        let mut cursor = mem::take(&mut self.cursor);
        cursor.commands.extend(Command::new(cursor.argv));
        let pipeline = Pipeline {
            commands: cursor.commands,
            input: cursor.input.map(PathBuf::from),
            output: cursor.output.map(|(path, mode)| OutputTarget {
                path: PathBuf::from(path),
                mode,
            }),
        };
        self.state = State::Normal;
        self.push(Statement::Ready(pipeline));
    }

    fn discard(&mut self, error: LimitError) {
        self.cursor = Cursor::default();
        self.state = State::Skipping {
            quoted: matches!(self.state, State::InQuote(_)),
        };
        self.push(Statement::Discarded(error));
    }

    fn push(&mut self, statement: Statement) {
        let statement = if self.sequence.statements.len() >= self.limits.max_statements {
            Statement::Discarded(LimitError::TooManyStatements)
        } else {
            statement
        };
        debug!(?statement, "statement parsed");
        self.sequence.statements.push(statement);
    }
}

/// Scan one input line into the statements it contains.
///
/// A [`SyntaxError`] rejects the line as a whole. Statements that break a
/// [`Limits`] threshold come back as [`Statement::Discarded`] in their place,
/// so the caller can report them in order while running the others.
pub fn parse_line(line: &str, limits: &Limits) -> Result<CommandSequence, SyntaxError> {
    if line.len() > limits.max_line_len {
        return Err(SyntaxError::LineTooLong {
            len: line.len(),
            max: limits.max_line_len,
        });
    }
    Parser::new(line, limits).run()
}
