/// Validation thresholds applied while scanning an input line.
///
/// None of these bound an allocation; they only decide when a statement is
/// rejected. The defaults match the limits the shell has always shipped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Statements (`;`-separated pipelines) per line.
    pub max_statements: usize,
    /// Commands per pipeline.
    pub max_stages: usize,
    /// Tokens per command, program name included.
    pub max_args: usize,
    /// Bytes per argument token.
    pub max_token_len: usize,
    /// Bytes per redirection path.
    pub max_path_len: usize,
    /// Bytes per input line, excluding the trailing newline.
    pub max_line_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_statements: 8,
            max_stages: 8,
            max_args: 8,
            max_token_len: 255,
            max_path_len: 63,
            max_line_len: 256,
        }
    }
}
