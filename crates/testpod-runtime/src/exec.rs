//! Results of commands executed inside running containers.

use std::time::Duration;

use testpod_common::error::TestpodError;

/// Output from an exec command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code returned by the command, `-1` if it was killed by a signal.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Builds a successful output carrying only stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// Builds a failed output carrying only stderr.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Returns whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) if self.stdout.ends_with('\n') => {
                format!("{}{}", self.stdout, self.stderr)
            }
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Error for a command still running when its time limit ran out.
#[must_use]
pub fn overran(cmd: &[String], limit: Duration) -> TestpodError {
    TestpodError::Command {
        command: format!("exec {}", cmd.join(" ")),
        message: format!("still running after {limit:?}, abandoned"),
    }
}

impl From<std::process::Output> for ExecOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_joins_streams() {
        let out = ExecOutput {
            stdout: "out\n".into(),
            stderr: "err\n".into(),
            exit_code: 1,
        };
        assert_eq!(out.combined(), "out\nerr\n");
        assert!(!out.success());
    }

    #[test]
    fn combined_keeps_streams_on_separate_lines() {
        let out = ExecOutput {
            stdout: "partial".into(),
            stderr: "error: boom\n".into(),
            exit_code: 1,
        };
        assert_eq!(out.combined(), "partial\nerror: boom\n");
    }

    #[test]
    fn overran_names_command_and_limit() {
        let err = overran(&["pg_isready".into()], Duration::from_millis(200));
        let msg = err.to_string();
        assert!(msg.contains("pg_isready"));
        assert!(msg.contains("200ms"));
    }

    #[test]
    fn helpers_set_exit_codes() {
        assert!(ExecOutput::ok("1").success());
        let failed = ExecOutput::failed(2, "boom");
        assert_eq!(failed.exit_code, 2);
        assert_eq!(failed.combined(), "boom");
    }
}
