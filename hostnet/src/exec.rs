//! Process execution for the platforms that program the host by shelling
//! out.
//!
//! The contract is synchronous and blocking. A non-zero exit status is an
//! error carrying both the exit cause and the captured output; retry policy
//! belongs to the caller.

use std::io;
use std::process::Command;

/// Runs one external command and captures what it printed.
///
/// Implementations must be safe to call from multiple threads; nothing here
/// serializes callers.
pub trait CommandRunner: Send + Sync {
    /// Runs the command and returns its merged stdout/stderr.
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ExecError>;

    /// Runs the command and returns its stdout only.
    fn run_stdout(&self, program: &str, args: &[&str]) -> Result<String, ExecError>;

    /// Runs the command for its exit status alone.
    fn run_status(&self, program: &str, args: &[&str]) -> Result<(), ExecError> {
        self.run(program, args).map(|_| ())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {}: {output}", display_code(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

impl ExecError {
    /// The exit code, when the process exited (rather than failing to spawn
    /// or dying to a signal).
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Failed { code, .. } => *code,
            ExecError::Spawn { .. } => None,
        }
    }

    /// True when the process ran and exited non-zero, i.e. the command
    /// itself declined rather than being missing.
    pub fn is_exit(&self) -> bool {
        matches!(self, ExecError::Failed { code: Some(_), .. })
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_owned(),
    }
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// The production runner: spawns the process and waits for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    fn output(&self, program: &str, args: &[&str]) -> Result<std::process::Output, ExecError> {
        Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ExecError::Spawn {
                command: command_line(program, args),
                source,
            })
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ExecError> {
        let output = self.output(program, args)?;

        let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
        merged.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ExecError::Failed {
                command: command_line(program, args),
                code: output.status.code(),
                output: merged.trim().to_owned(),
            });
        }

        Ok(merged)
    }

    fn run_stdout(&self, program: &str, args: &[&str]) -> Result<String, ExecError> {
        let output = self.output(program, args)?;

        if !output.status.success() {
            let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
            merged.push_str(&String::from_utf8_lossy(&output.stderr));

            return Err(ExecError::Failed {
                command: command_line(program, args),
                code: output.status.code(),
                output: merged.trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_family = "unix")]
    #[test]
    fn captures_stdout() {
        let out = SystemRunner.run_stdout("sh", &["-c", "echo hello"]).unwrap();

        assert_eq!(out.trim(), "hello");
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn merges_stderr_into_run_output() {
        let out = SystemRunner
            .run("sh", &["-c", "echo out; echo err >&2"])
            .unwrap();

        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn nonzero_exit_reports_code_and_output() {
        let err = SystemRunner
            .run("sh", &["-c", "echo boom >&2; exit 3"])
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let err = SystemRunner
            .run("definitely-not-a-real-binary", &[])
            .unwrap_err();

        assert!(matches!(err, ExecError::Spawn { .. }));
        assert_eq!(err.exit_code(), None);
    }
}
