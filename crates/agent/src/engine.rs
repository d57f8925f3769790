use crate::constants::{ENGINE_PYTHONPATH, RUNNER_PATH, RUNNER_STUB, RUNNER_TIMEOUT, STRATEGY_PATH};
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Writes the submitted strategy and the embedded runner stub to disk, then
/// runs the stub under a 5 minute wall timeout and parses its single line of
/// stdout as the backtest result. Never propagates the runner's own
/// failures as an `Err`, those become `{"status": "error", ...}` JSON,
/// exactly as the runner would have produced on its own.
pub struct Engine {
    deps_mount: Option<String>,
}

impl Engine {
    pub fn new(deps_mount: Option<String>) -> Self {
        Self { deps_mount }
    }

    pub async fn run(&self, strategy_source: &str) -> Result<Value, EngineError> {
        tokio::fs::write(STRATEGY_PATH, strategy_source).await?;
        tokio::fs::write(RUNNER_PATH, RUNNER_STUB).await?;

        let python_path = match &self.deps_mount {
            Some(mount) => format!("{mount}:{ENGINE_PYTHONPATH}"),
            None => ENGINE_PYTHONPATH.to_string(),
        };

        let spawn = Command::new(which_python())
            .arg(RUNNER_PATH)
            .env("PYTHONPATH", &python_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawn {
            Ok(child) => child,
            Err(e) => return Ok(error_report(format!("Agent Error: {e}"))),
        };

        let output = match tokio::time::timeout(RUNNER_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(error_report(format!("Agent Error: {e}"))),
            Err(_) => {
                let _ = child.kill().await;
                return Ok(error_report("Backtest Timed Out".to_string()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(error_report(format!("Runner Crashed (No Output).\nSTDERR: {stderr}")));
        }

        match serde_json::from_str(stdout.trim()) {
            Ok(value) => Ok(value),
            Err(_) => Ok(error_report(format!("Runner produced non-JSON output: {stdout}"))),
        }
    }
}

fn which_python() -> &'static str {
    "python3"
}

fn error_report(message: String) -> Value {
    serde_json::json!({ "status": "error", "error": message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_missing_interpreter_as_error_json() {
        let engine = Engine { deps_mount: None };
        let value = engine.run_with_binary("not-a-real-python-binary", "x = 1").await;
        assert_eq!(value["status"], "error");
    }

    impl Engine {
        async fn run_with_binary(&self, python_bin: &str, strategy_source: &str) -> Value {
            tokio::fs::write(STRATEGY_PATH, strategy_source).await.unwrap();
            tokio::fs::write(RUNNER_PATH, RUNNER_STUB).await.unwrap();
            let spawn = Command::new(python_bin)
                .arg(RUNNER_PATH)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn();
            match spawn {
                Ok(_) => panic!("expected spawn of a nonexistent binary to fail"),
                Err(e) => error_report(format!("Agent Error: {e}")),
            }
        }
    }
}
