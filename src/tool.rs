use crate::error::{ResignError, Result};
use log::debug;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Environment variable carrying the container password to `openssl -passin env:`.
pub const PASSWORD_ENV: &str = "RESIGNER_PASSIN";

/// A located `openssl` binary plus the deadline applied to every invocation.
#[derive(Debug, Clone)]
pub struct OpensslTool {
    path: PathBuf,
    timeout: Duration,
}

impl OpensslTool {
    pub fn new<P: AsRef<Path>>(path: P, timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// Find `openssl` on `PATH` unless an explicit path is configured.
    pub fn locate(explicit: Option<&Path>, timeout: Duration) -> Option<Self> {
        match explicit {
            Some(path) if path.is_file() => Some(Self::new(path, timeout)),
            Some(path) => which::which(path).ok().map(|p| Self::new(p, timeout)),
            None => which::which("openssl").ok().map(|p| Self::new(p, timeout)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run openssl with `args`, returning stdout on success.
    ///
    /// `password` is exported as [`PASSWORD_ENV`] to the child only; it is
    /// never part of the argument list and never logged.
    pub fn run<I, S>(&self, args: I, password: Option<&str>) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        debug!(
            "running {} {}",
            self.path.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut expr = duct::cmd(self.path.as_path(), &args)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        if let Some(password) = password {
            expr = expr.env(PASSWORD_ENV, password);
        }

        let handle = expr
            .start()
            .map_err(|e| {
                ResignError::Tool(format!("failed to spawn {}: {}", self.path.display(), e))
            })?;

        let output = wait_with_deadline(&handle, self.timeout).map_err(|e| match e {
            WaitError::TimedOut => ResignError::Timeout {
                tool: "openssl".to_string(),
                after: self.timeout,
            },
            WaitError::Io(e) => ResignError::Tool(format!("waiting on openssl: {}", e)),
        })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first_line = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("no output");
            Err(ResignError::Tool(format!(
                "openssl exited with {}: {}",
                output.status,
                first_line.trim()
            )))
        }
    }
}

enum WaitError {
    TimedOut,
    Io(std::io::Error),
}

fn wait_with_deadline(
    handle: &duct::Handle,
    timeout: Duration,
) -> std::result::Result<Output, WaitError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(output) = handle.try_wait().map_err(WaitError::Io)? {
            return Ok(output.clone());
        }
        if Instant::now() >= deadline {
            // The child must not outlive the stage.
            let _ = handle.kill();
            return Err(WaitError::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh() -> OpensslTool {
        OpensslTool::new("/bin/sh", Duration::from_secs(5))
    }

    #[test]
    fn captures_stdout() {
        let out = sh().run(["-c", "printf hello"], None).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn password_travels_through_env_only() {
        let script = format!("printf %s \"${}\"", PASSWORD_ENV);
        let out = sh().run(["-c", script.as_str()], Some("s3cret")).unwrap();
        assert_eq!(out, b"s3cret");
    }

    #[test]
    fn non_zero_exit_reports_stderr() {
        let err = sh().run(["-c", "echo boom >&2; exit 3"], None).unwrap_err();
        match err {
            ResignError::Tool(msg) => assert!(msg.contains("boom"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn slow_child_is_killed() {
        let tool = OpensslTool::new("/bin/sh", Duration::from_millis(200));
        let started = Instant::now();
        let err = tool.run(["-c", "exec sleep 5"], None).unwrap_err();
        assert!(matches!(err, ResignError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_binary_is_a_tool_error() {
        let tool = OpensslTool::new("/nonexistent/openssl", Duration::from_secs(1));
        assert!(matches!(tool.run(["version"], None), Err(ResignError::Tool(_))));
    }
}
