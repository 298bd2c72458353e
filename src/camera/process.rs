//! Child process management for the command-line camera tools.
//!
//! Handles spawning, monitoring, and terminating `rpicam-*` and `ffmpeg`.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::types::CameraError;

/// How long a child gets to exit after SIGINT before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Map a spawn error, turning a missing executable into `CommandNotFound`.
pub fn spawn_error(program: &str, e: std::io::Error) -> CameraError {
    if e.kind() == std::io::ErrorKind::NotFound {
        CameraError::CommandNotFound(program.to_string())
    } else {
        CameraError::Io(e)
    }
}

/// A long-running child whose stderr is drained into the log.
pub struct ManagedChild {
    program: String,
    child: Child,
    stderr_thread: Option<JoinHandle<Vec<String>>>,
}

impl ManagedChild {
    /// Spawn `program` with the given stdio wiring. Stderr is always piped.
    pub fn spawn(
        program: &str,
        args: &[String],
        stdin: Stdio,
        stdout: Stdio,
    ) -> Result<Self, CameraError> {
        log::debug!("Spawning {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        let stderr = child.stderr.take();
        let name = program.to_string();
        let stderr_thread = stderr.map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                let mut lines = Vec::new();
                for line in reader.lines() {
                    match line {
                        Ok(l) => {
                            log::debug!("[{}] {}", name, l);
                            lines.push(l);
                        }
                        Err(_) => break,
                    }
                }
                lines
            })
        });

        Ok(Self {
            program: program.to_string(),
            child,
            stderr_thread,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Hand over stdout so it can feed the next process in a pipe.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Check if the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status if the process has already exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Request a graceful shutdown.
    ///
    /// Sends SIGINT and waits up to [`SHUTDOWN_GRACE`]; kills the process if
    /// it is still alive after that.
    pub fn shutdown(&mut self) -> Result<ExitStatus, CameraError> {
        if let Some(status) = self.exit_status() {
            return Ok(status);
        }

        #[cfg(unix)]
        {
            // SAFETY: kill(2) on a pid we own; a stale pid only yields ESRCH.
            unsafe {
                libc::kill(self.child.id() as i32, libc::SIGINT);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }

        let start = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start.elapsed() > SHUTDOWN_GRACE {
                        log::warn!("{} did not exit after SIGINT, killing", self.program);
                        let _ = self.child.kill();
                        return self.child.wait().map_err(CameraError::Io);
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(CameraError::Io(e)),
            }
        }
    }

    /// Collected stderr output. Only complete once the process has exited.
    pub fn take_stderr_output(&mut self) -> Vec<String> {
        self.stderr_thread
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.shutdown();
        }
    }
}

/// Run a program to completion and return its stdout.
pub fn run_to_completion(program: &str, args: &[String]) -> Result<Vec<u8>, CameraError> {
    log::debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| spawn_error(program, e))?;

    if !output.status.success() {
        return Err(CameraError::CommandFailed {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_is_command_not_found() {
        let err = run_to_completion("lapsecam-definitely-not-installed", &[]).unwrap_err();
        assert!(matches!(err, CameraError::CommandNotFound(name) if name == "lapsecam-definitely-not-installed"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_to_completion_captures_stdout() {
        let out = run_to_completion("sh", &["-c".to_string(), "printf hello".to_string()]).unwrap();
        assert_eq!(out, b"hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_command_reports_stderr() {
        let err = run_to_completion(
            "sh",
            &["-c".to_string(), "echo broken >&2; exit 3".to_string()],
        )
        .unwrap_err();
        match err {
            CameraError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_shutdown_interrupts_long_running_child() {
        let mut child = ManagedChild::spawn(
            "sleep",
            &["30".to_string()],
            Stdio::null(),
            Stdio::null(),
        )
        .unwrap();
        assert!(child.is_running());
        let started = Instant::now();
        child.shutdown().unwrap();
        assert!(!child.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
