//! Narrow seam over external process execution.
//!
//! The probe and remux steps only need "run this program with these args and tell me what
//! happened", so they talk to a [`CommandRunner`] instead of `std::process` directly. Tests
//! substitute a scripted runner.

use std::ffi::OsString;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

/// Captured result of one external invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status_string(&self) -> String {
        match self.code {
            Some(c) => format!("exit code {c}"),
            None => "terminated by signal".to_string(),
        }
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

pub trait CommandRunner {
    /// Run `program` with `args` to completion, capturing both output streams.
    ///
    /// An `Err` means the process could not be started (or timed out); a non-zero exit is an
    /// `Ok` with `success() == false`.
    fn run(&self, program: &Path, args: &[OsString]) -> io::Result<CommandOutput>;
}

/// Runs real executables via `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        SystemRunner { timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> io::Result<CommandOutput> {
        debug!("running {} {:?}", program.display(), args);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let Some(timeout) = self.timeout else {
            // `output()` drains stdout and stderr concurrently.
            let out = cmd.output()?;
            return Ok(CommandOutput {
                stdout: out.stdout,
                stderr: out.stderr,
                code: out.status.code(),
            });
        };

        let child = cmd.spawn()?;
        wait_with_timeout(child, program, timeout)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            let _ = p.read_to_end(&mut buf);
        }
        buf
    })
}

fn wait_with_timeout(mut child: Child, program: &Path, timeout: Duration) -> io::Result<CommandOutput> {
    // Both pipes are drained on their own threads so a chatty child never blocks on a full
    // pipe while we poll.
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout.join();
            let _ = stderr.join();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", program.display(), timeout),
            ));
        }
        thread::sleep(Duration::from_millis(25));
    };

    Ok(CommandOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
        code: status.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_covers_signal_case() {
        let out = CommandOutput {
            code: None,
            ..Default::default()
        };
        assert!(!out.success());
        assert_eq!(out.status_string(), "terminated by signal");
    }

    #[test]
    fn stderr_is_trimmed() {
        let out = CommandOutput {
            stderr: b"  boom\n".to_vec(),
            code: Some(1),
            ..Default::default()
        };
        assert_eq!(out.stderr_lossy(), "boom");
        assert_eq!(out.status_string(), "exit code 1");
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let runner = SystemRunner::new();
        let res = runner.run(Path::new("/definitely/not/a/real/binary-xyz"), &[]);
        assert!(res.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_and_exit_code() {
        let runner = SystemRunner::new();
        let args: Vec<OsString> = vec!["-c".into(), "echo out; echo err 1>&2; exit 3".into()];
        let out = runner.run(Path::new("sh"), &args).unwrap();
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.stderr, b"err\n");
        assert_eq!(out.code, Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_hung_child() {
        let runner = SystemRunner::with_timeout(Some(Duration::from_millis(100)));
        let args: Vec<OsString> = vec!["-c".into(), "sleep 5".into()];
        let err = runner.run(Path::new("sh"), &args).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_path_still_captures_output() {
        let runner = SystemRunner::with_timeout(Some(Duration::from_secs(10)));
        let args: Vec<OsString> = vec!["-c".into(), "echo hi".into()];
        let out = runner.run(Path::new("sh"), &args).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, b"hi\n");
    }
}
