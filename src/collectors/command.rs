use crate::collectors::CollectError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    pub fn into_failure(self, program: &str) -> CollectError {
        CollectError::CommandFailed {
            program: program.to_string(),
            code: self.code,
            stderr: self.stderr_text(),
        }
    }
}

/// Runs external programs for the probes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CollectError>;
}

/// Spawns real processes. A child is killed when its future is dropped,
/// so callers bound a run with `tokio::time::timeout`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CollectError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CollectError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_runner_captures_exit_code_and_output() {
        let out = SystemRunner
            .run("sh", &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()])
            .await
            .expect("sh should start");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(out.stderr_text(), "err");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = SystemRunner
            .run("monitools-no-such-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Spawn { .. }));
    }
}
