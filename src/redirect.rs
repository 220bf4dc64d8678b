//! Rebinding of standard streams onto files.
//!
//! Everything here mutates the calling process's descriptor table, so it is
//! only ever called from a freshly forked child right before `exec`.

use crate::command::OutputMode;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use std::os::fd::RawFd;
use std::path::Path;

/// Open `path` and make it available as descriptor `fd`.
///
/// When the kernel already hands back `fd` (because it was closed) there is
/// nothing left to do; otherwise the new descriptor is duplicated onto `fd`
/// and the original is closed.
pub fn redirect_stream(fd: RawFd, path: &Path, flags: OFlag, mode: Mode) -> nix::Result<()> {
    let opened = fcntl::open(path, flags, mode)?;
    if opened == fd {
        return Ok(());
    }
    let duplicated = unistd::dup2(opened, fd);
    unistd::close(opened)?;
    duplicated.map(drop)
}

/// Read standard input from `path`.
pub fn redirect_input(path: &Path) -> nix::Result<()> {
    redirect_stream(
        nix::libc::STDIN_FILENO,
        path,
        OFlag::O_RDONLY,
        Mode::S_IRUSR,
    )
}

/// Send standard output to `path`, creating it readable and writable by everyone
/// (before umask) when it does not exist.
pub fn redirect_output(path: &Path, mode: OutputMode) -> nix::Result<()> {
    let placement = match mode {
        OutputMode::Truncate => OFlag::O_TRUNC,
        OutputMode::Append => OFlag::O_APPEND,
    };
    redirect_stream(
        nix::libc::STDOUT_FILENO,
        path,
        OFlag::O_RDWR | OFlag::O_CREAT | placement,
        Mode::S_IRUSR
            | Mode::S_IWUSR
            | Mode::S_IRGRP
            | Mode::S_IWGRP
            | Mode::S_IROTH
            | Mode::S_IWOTH,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};
    use std::fs;
    use std::io::{self, Read, Write};
    use std::mem::ManuallyDrop;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn make_unique_temp_dir(tag: &str) -> io::Result<PathBuf> {
        let mut p = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("tiny_shell_redirect_{}_{}_{}", tag, std::process::id(), nanos));
        fs::create_dir_all(&p)?;
        Ok(p)
    }

    /// Borrow a standard descriptor as a `File` without taking ownership of it.
    fn borrow_fd(fd: RawFd) -> ManuallyDrop<fs::File> {
        ManuallyDrop::new(unsafe { fs::File::from_raw_fd(fd) })
    }

    /// Run `body` in a forked child and return its exit code.
    fn in_child(body: impl FnOnce() -> bool) -> i32 {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = body();
                unsafe { nix::libc::_exit(if ok { 0 } else { 1 }) }
            }
            ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, code) => code,
                other => panic!("child ended abnormally: {:?}", other),
            },
        }
    }

    #[test]
    fn test_redirect_stream_onto_spare_descriptor() {
        let dir = make_unique_temp_dir("spare").unwrap();
        let path = dir.join("data.txt");
        fs::write(&path, "payload").unwrap();

        // Reserve a descriptor number, then rebind it onto the file.
        let spare = fs::File::open("/dev/null").unwrap();
        let target = spare.as_raw_fd();
        redirect_stream(target, &path, OFlag::O_RDONLY, Mode::empty()).unwrap();

        let mut reopened = fs::File::from(unsafe { OwnedFd::from_raw_fd(target) });
        std::mem::forget(spare);
        let mut contents = String::new();
        reopened.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "payload");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_redirect_stream_missing_file_fails() {
        let dir = make_unique_temp_dir("missing").unwrap();
        let res = redirect_stream(
            1000,
            &dir.join("does-not-exist"),
            OFlag::O_RDONLY,
            Mode::empty(),
        );
        assert_eq!(res, Err(nix::errno::Errno::ENOENT));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_redirect_output_truncate_then_append() {
        let dir = make_unique_temp_dir("out").unwrap();
        let path = dir.join("out.txt");

        for (text, mode) in [
            ("first\n", OutputMode::Truncate),
            ("second\n", OutputMode::Truncate),
            ("third\n", OutputMode::Append),
        ] {
            let code = in_child(|| {
                redirect_output(&path, mode).is_ok()
                    && borrow_fd(nix::libc::STDOUT_FILENO)
                        .write_all(text.as_bytes())
                        .is_ok()
            });
            assert_eq!(code, 0);
        }

        assert_eq!(fs::read_to_string(&path).unwrap(), "second\nthird\n");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_redirect_input_reads_file() {
        let dir = make_unique_temp_dir("in").unwrap();
        let path = dir.join("in.txt");
        fs::write(&path, "expected").unwrap();

        let code = in_child(|| {
            let mut buf = String::new();
            redirect_input(&path).is_ok()
                && borrow_fd(nix::libc::STDIN_FILENO)
                    .read_to_string(&mut buf)
                    .is_ok()
                && buf == "expected"
        });
        assert_eq!(code, 0);
        let _ = fs::remove_dir_all(dir);
    }
}
