//! Launching a pipeline as a chain of processes.
//!
//! Every stage gets its own `fork` + `execvp`. Consecutive stages are joined by
//! anonymous pipes whose descriptors live in a [`StagePipe`] guard, so an early
//! return on any failing system call closes whatever the parent still holds.

use crate::command::{Command, ExitCode, Pipeline};
use crate::redirect::{redirect_input, redirect_output};
use nix::errno::Errno;
use nix::libc::{STDIN_FILENO, STDOUT_FILENO};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid};
use std::convert::Infallible;
use std::ffi::{CString, NulError};
use std::fmt;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use thiserror::Error;
use tracing::debug;

/// How long the shell waits on the processes it launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitMode {
    /// Block until every stage has exited.
    #[default]
    Block,
    /// Check each stage once without blocking; stages still running count as success
    /// and are handed to [`Stragglers`] to be reaped later.
    Poll,
}

/// Children the shell launched but has not reaped yet.
///
/// Poll mode leaves running stages here, as does a pipeline that failed part
/// way through. [`Stragglers::reap`] collects whichever have finished since.
#[derive(Debug, Default)]
pub struct Stragglers {
    pids: Vec<Pid>,
}

impl Stragglers {
    /// Reap every finished child without blocking, keeping those still running.
    pub fn reap(&mut self) {
        self.pids.retain(|&pid| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                debug!(%pid, ?status, "straggler reaped");
                false
            }
            Err(_) => false,
        });
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// Failures seen by the parent while running a pipeline.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("pipe() failed: {0}")]
    Pipe(Errno),
    #[error("fork() failed: {0}")]
    Fork(Errno),
    #[error("close() failed: {0}")]
    Close(Errno),
    #[error("waitpid() failed: {0}")]
    Wait(Errno),
    #[error("invalid argument for [{program}]: {source}")]
    InvalidArgument { program: String, source: NulError },
    #[error("[{program}] {reason}")]
    AbnormalExit { program: String, reason: String },
}

/// Both ends of the pipe between one stage and the next.
///
/// Dropping the guard closes any end that is still open.
#[derive(Debug)]
struct StagePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl StagePipe {
    fn open() -> Result<Self, ExecError> {
        let (read, write) = unistd::pipe().map_err(ExecError::Pipe)?;
        Ok(Self { read, write })
    }

    /// Close both ends, reporting the first failure.
    fn close(self) -> nix::Result<()> {
        let read = unistd::close(self.read.into_raw_fd());
        let write = unistd::close(self.write.into_raw_fd());
        read.and(write)
    }
}

/// A system call that failed inside a forked child.
struct ChildFailure {
    call: &'static str,
    errno: Errno,
}

impl fmt::Display for ChildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}() failed: {}", self.call, self.errno)
    }
}

trait During<T> {
    fn during(self, call: &'static str) -> Result<T, ChildFailure>;
}

impl<T> During<T> for nix::Result<T> {
    fn during(self, call: &'static str) -> Result<T, ChildFailure> {
        self.map_err(|errno| ChildFailure { call, errno })
    }
}

/// Move a pipe end onto a standard descriptor and drop the original.
fn bind(end: OwnedFd, target: i32) -> Result<(), ChildFailure> {
    unistd::dup2(end.as_raw_fd(), target).during("dup2")?;
    unistd::close(end.into_raw_fd()).during("close")
}

/// Everything a child needs to become one stage of the pipeline.
struct Stage<'a> {
    pipeline: &'a Pipeline,
    index: usize,
    argv: &'a [CString],
    upstream: Option<StagePipe>,
    downstream: Option<StagePipe>,
}

impl Stage<'_> {
    fn is_first(&self) -> bool {
        self.index == 0
    }

    fn is_last(&self) -> bool {
        self.index + 1 == self.pipeline.commands.len()
    }

    /// Rewire the standard streams and replace the process image.
    fn exec(self) -> Result<Infallible, ChildFailure> {
        let (first, last) = (self.is_first(), self.is_last());
        if first {
            if let Some(path) = &self.pipeline.input {
                redirect_input(path).during("redirect_input")?;
            }
        }
        if let Some(StagePipe { read, write }) = self.downstream {
            unistd::close(read.into_raw_fd()).during("close")?;
            bind(write, STDOUT_FILENO)?;
        }
        if last {
            if let Some(target) = &self.pipeline.output {
                redirect_output(&target.path, target.mode).during("redirect_output")?;
            }
        }
        if let Some(StagePipe { read, write }) = self.upstream {
            unistd::close(write.into_raw_fd()).during("close")?;
            bind(read, STDIN_FILENO)?;
        }
        unistd::execvp(&self.argv[0], self.argv).during("execvp")
    }

    /// Child side of the fork: never returns to the caller.
    fn run(self) -> ! {
        match self.exec() {
            Ok(never) => match never {},
            Err(failure) => {
                eprintln!("{failure}");
                unsafe { nix::libc::_exit(1) }
            }
        }
    }
}

fn c_argv(command: &Command) -> Result<Vec<CString>, ExecError> {
    command
        .argv()
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<_, _>>()
        .map_err(|source| ExecError::InvalidArgument {
            program: command.name().to_string(),
            source,
        })
}

fn describe(status: WaitStatus) -> String {
    match status {
        WaitStatus::Signaled(_, signal, core) => {
            let core = if core { " (core dumped)" } else { "" };
            format!("killed by {}{}", signal.as_str(), core)
        }
        WaitStatus::Stopped(_, signal) => format!("stopped by {}", signal.as_str()),
        other => format!("ended unexpectedly: {other:?}"),
    }
}

/// Fork one child per stage, recording each pid in `children` as it starts.
fn launch(
    pipeline: &Pipeline,
    argvs: &[Vec<CString>],
    children: &mut Vec<Pid>,
) -> Result<(), ExecError> {
    let mut upstream: Option<StagePipe> = None;
    for (index, argv) in argvs.iter().enumerate() {
        let downstream = if index + 1 < argvs.len() {
            Some(StagePipe::open()?)
        } else {
            None
        };
        match unsafe { unistd::fork() }.map_err(ExecError::Fork)? {
            ForkResult::Child => Stage {
                pipeline,
                index,
                argv,
                upstream,
                downstream,
            }
            .run(),
            ForkResult::Parent { child } => {
                debug!(pid = %child, program = %pipeline.commands[index].name(), index, "stage launched");
                children.push(child);
                if let Some(pipe) = upstream.take() {
                    pipe.close().map_err(ExecError::Close)?;
                }
                upstream = downstream;
            }
        }
    }
    Ok(())
}

/// Run every command of `pipeline` as its own process, stdout of each stage
/// feeding stdin of the next.
///
/// `pipeline.input` is applied to the first stage and `pipeline.output` to the
/// last. All stages are launched before any is waited on, then reaped in order.
/// The returned code is that of the last stage; a stage killed or stopped by a
/// signal fails the call without waiting on the stages after it.
///
/// A pipe or fork failure stops launching further stages. Children that are
/// already running are left alone; every child that is not reaped here ends up
/// in `stragglers`.
pub fn run_pipeline(
    pipeline: &Pipeline,
    wait: WaitMode,
    stragglers: &mut Stragglers,
) -> Result<ExitCode, ExecError> {
    let argvs = pipeline
        .commands
        .iter()
        .map(c_argv)
        .collect::<Result<Vec<_>, _>>()?;

    let mut children = Vec::with_capacity(argvs.len());
    if let Err(e) = launch(pipeline, &argvs, &mut children) {
        stragglers.pids.extend(children);
        return Err(e);
    }

    let flags = match wait {
        WaitMode::Block => WaitPidFlag::WUNTRACED,
        WaitMode::Poll => WaitPidFlag::WNOHANG,
    };
    let mut code = 0;
    let mut pending = children.iter().copied().zip(&pipeline.commands);
    while let Some((child, command)) = pending.next() {
        let status = match waitpid(child, Some(flags)) {
            Ok(status) => status,
            Err(errno) => {
                stragglers.pids.extend(pending.map(|(pid, _)| pid));
                return Err(ExecError::Wait(errno));
            }
        };
        debug!(pid = %child, ?status, "stage reaped");
        code = match status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::StillAlive => {
                stragglers.pids.push(child);
                0
            }
            other => {
                stragglers.pids.extend(pending.map(|(pid, _)| pid));
                return Err(ExecError::AbnormalExit {
                    program: command.name().to_string(),
                    reason: describe(other),
                });
            }
        };
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{OutputMode, OutputTarget};
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    fn make_unique_temp_dir(tag: &str) -> io::Result<PathBuf> {
        let mut p = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("tiny_shell_exec_{}_{}_{}", tag, std::process::id(), nanos));
        fs::create_dir_all(&p)?;
        Ok(p)
    }

    fn pipeline(stages: &[&[&str]]) -> Pipeline {
        Pipeline::new(
            stages
                .iter()
                .map(|argv| Command::new(argv.iter().map(|s| s.to_string()).collect()).unwrap())
                .collect(),
        )
    }

    fn writing_to(mut p: Pipeline, path: &Path, mode: OutputMode) -> Pipeline {
        p.output = Some(OutputTarget {
            path: path.to_path_buf(),
            mode,
        });
        p
    }

    #[test]
    fn test_single_command_with_output_file() {
        let dir = make_unique_temp_dir("single").unwrap();
        let out = dir.join("out.txt");
        let p = writing_to(pipeline(&[&["echo", "hello"]]), &out, OutputMode::Truncate);

        assert_eq!(run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_pipe_carries_output_verbatim() {
        let dir = make_unique_temp_dir("pipe").unwrap();
        let out = dir.join("out.txt");
        let p = writing_to(
            pipeline(&[&["echo", "hello"], &["cat"]]),
            &out,
            OutputMode::Truncate,
        );

        assert_eq!(run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_three_stages_with_input_file() {
        let dir = make_unique_temp_dir("three").unwrap();
        let input = dir.join("in.txt");
        let out = dir.join("out.txt");
        fs::write(&input, "pear\napple\npear\nfig\n").unwrap();

        let mut p = writing_to(
            pipeline(&[&["cat"], &["sort"], &["uniq"]]),
            &out,
            OutputMode::Truncate,
        );
        p.input = Some(input);

        assert_eq!(run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "apple\nfig\npear\n");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_truncate_keeps_last_run_and_append_concatenates() {
        let dir = make_unique_temp_dir("modes").unwrap();
        let truncated = dir.join("t.txt");
        let appended = dir.join("a.txt");

        for word in ["one", "two"] {
            let p = writing_to(pipeline(&[&["echo", word]]), &truncated, OutputMode::Truncate);
            run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap();
            let p = writing_to(pipeline(&[&["echo", "a"]]), &appended, OutputMode::Append);
            run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap();
        }

        assert_eq!(fs::read_to_string(&truncated).unwrap(), "two\n");
        assert_eq!(fs::read_to_string(&appended).unwrap(), "a\na\n");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_large_output_does_not_stall_between_stages() {
        let dir = make_unique_temp_dir("large").unwrap();
        let out = dir.join("count.txt");
        let p = writing_to(
            pipeline(&[&["head", "-c", "1000000", "/dev/zero"], &["wc", "-c"]]),
            &out,
            OutputMode::Truncate,
        );

        assert_eq!(run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "1000000");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_exit_code_of_last_stage_is_returned() {
        let p = pipeline(&[&["sh", "-c", "exit 3"]]);
        assert_eq!(run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap(), 3);

        let p = pipeline(&[&["true"], &["sh", "-c", "exit 4"]]);
        assert_eq!(run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap(), 4);
    }

    #[test]
    fn test_exec_failure_only_ends_the_child() {
        let p = pipeline(&[&["tiny-shell-no-such-program"]]);
        assert_eq!(run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap(), 1);
    }

    #[test]
    fn test_missing_input_file_fails_the_first_stage() {
        let dir = make_unique_temp_dir("noinput").unwrap();
        let mut p = pipeline(&[&["cat"]]);
        p.input = Some(dir.join("absent.txt"));
        assert_eq!(run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()).unwrap(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_signalled_stage_is_an_error() {
        let p = pipeline(&[&["sh", "-c", "kill -9 $$"]]);
        match run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()) {
            Err(ExecError::AbnormalExit { program, reason }) => {
                assert_eq!(program, "sh");
                assert!(reason.contains("SIGKILL"), "unexpected reason: {reason}");
            }
            other => panic!("expected abnormal exit, got {other:?}"),
        }
    }

    #[test]
    fn test_poll_does_not_wait_for_completion() {
        let p = pipeline(&[&["sleep", "2"]]);
        let started = Instant::now();
        let mut stragglers = Stragglers::default();
        assert_eq!(run_pipeline(&p, WaitMode::Poll, &mut stragglers).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stragglers.len(), 1);
    }

    #[test]
    fn test_polled_stages_are_reaped_once_finished() {
        let p = pipeline(&[&["sleep", "0.2"], &["cat"]]);
        let mut stragglers = Stragglers::default();
        assert_eq!(run_pipeline(&p, WaitMode::Poll, &mut stragglers).unwrap(), 0);
        assert_eq!(stragglers.len(), 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !stragglers.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
            stragglers.reap();
        }
        assert!(stragglers.is_empty());
    }

    #[test]
    fn test_blocking_run_leaves_no_stragglers() {
        let p = pipeline(&[&["echo", "x"], &["cat"], &["true"]]);
        let mut stragglers = Stragglers::default();
        run_pipeline(&p, WaitMode::Block, &mut stragglers).unwrap();
        assert!(stragglers.is_empty());
    }

    #[test]
    fn test_nul_byte_in_argument_is_rejected_before_fork() {
        let p = pipeline(&[&["echo", "a\0b"]]);
        assert!(matches!(
            run_pipeline(&p, WaitMode::Block, &mut Stragglers::default()),
            Err(ExecError::InvalidArgument { program, .. }) if program == "echo"
        ));
    }
}
