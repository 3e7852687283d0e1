//! Subprocess execution seam.
//!
//! The pipeline depends only on "run command, return exit status + output",
//! so builds can be tested without spawning real processes.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// A single command invocation: argv, working directory, environment.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl RunRequest {
    pub fn new(argv: &[String], cwd: &Path, env: &[(String, String)]) -> Self {
        Self {
            argv: argv.to_vec(),
            cwd: cwd.to_path_buf(),
            env: env.to_vec(),
        }
    }
}

/// Captured result of one command invocation.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Blocking command execution. One process at a time; the caller does not
/// proceed until the child has exited.
pub trait CommandRunner {
    fn run(&mut self, request: &RunRequest) -> Result<StepOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &mut R {
    fn run(&mut self, request: &RunRequest) -> Result<StepOutput> {
        (**self).run(request)
    }
}

/// Runs commands on the host via `std::process::Command`.
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&mut self, request: &RunRequest) -> Result<StepOutput> {
        let Some((program, args)) = request.argv.split_first() else {
            bail!("cannot run an empty command");
        };

        let output = Command::new(program)
            .args(args)
            .current_dir(&request.cwd)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .with_context(|| {
                format!(
                    "executing '{}' in '{}'",
                    request.argv.join(" "),
                    request.cwd.display()
                )
            })?;

        Ok(StepOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_runner_reports_exit_status() {
        let mut runner = HostRunner;
        let request = RunRequest::new(
            &["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            Path::new("."),
            &[],
        );
        let output = runner.run(&request).unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[test]
    fn host_runner_captures_output() {
        let mut runner = HostRunner;
        let request = RunRequest::new(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "echo out; echo err >&2".to_string(),
            ],
            Path::new("."),
            &[],
        );
        let output = runner.run(&request).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn host_runner_passes_env() {
        let mut runner = HostRunner;
        let request = RunRequest::new(
            &["sh".to_string(), "-c".to_string(), "echo $MARKER".to_string()],
            Path::new("."),
            &[("MARKER".to_string(), "hello".to_string())],
        );
        let output = runner.run(&request).unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn host_runner_rejects_empty_argv() {
        let mut runner = HostRunner;
        let request = RunRequest::new(&[], Path::new("."), &[]);
        assert!(runner.run(&request).is_err());
    }
}
