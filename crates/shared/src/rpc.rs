//! Wire types shared by the host-side orchestrator/broker and the guest agent.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of a `backtest_tasks` queue message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub code: String,
    pub requirements: String,
}

/// A status event as published on `backtest_updates` and cached under
/// `task_status:{task_id}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusEvent {
    Processing {
        task_id: String,
        message: String,
    },
    Success {
        task_id: String,
        metrics: Value,
        portfolio_summary: Value,
    },
    Error {
        task_id: String,
        message: String,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
}

impl StatusEvent {
    pub fn task_id(&self) -> &str {
        match self {
            StatusEvent::Processing { task_id, .. } => task_id,
            StatusEvent::Success { task_id, .. } => task_id,
            StatusEvent::Error { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusEvent::Processing { .. })
    }

    /// Build the terminal `error` event the worker publishes when the
    /// orchestrator (or the DIB) reports a failure for `task_id`.
    pub fn error(task_id: impl Into<String>, outcome: ResultOutcome) -> Self {
        match outcome {
            ResultOutcome::Error { kind, message, traceback } => {
                StatusEvent::Error { task_id: task_id.into(), message, kind: Some(kind), traceback }
            }
            ResultOutcome::Success { .. } => {
                unreachable!("error() called with a ResultOutcome::Success")
            }
        }
    }
}

/// The outcome the orchestrator hands back to the worker after a `run()`
/// call: either the guest's report, or a structured failure from any stage
/// (boot, handshake, framing, or the guest's own runner).
#[derive(Debug, Clone)]
pub enum ResultOutcome {
    Success { report: Value },
    Error { kind: String, message: String, traceback: Option<String> },
}

impl ResultOutcome {
    /// Interpret the JSON object the guest sent back over the result
    /// protocol. The guest's own shape is `{status, report}` or
    /// `{status, error}`; orchestrator-originated errors use `{status,
    /// type, message}`. Both are accepted here since by the time this is
    /// called we only know it parsed as JSON.
    pub fn from_guest_json(value: Value) -> Self {
        let status = value.get("status").and_then(Value::as_str).unwrap_or("");
        if status == "success" {
            return ResultOutcome::Success {
                report: value.get("report").cloned().unwrap_or(Value::Null),
            };
        }

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("StrategyError")
            .to_string();
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| value.get("error").and_then(Value::as_str))
            .unwrap_or("unknown error")
            .to_string();
        let traceback = value
            .get("traceback")
            .and_then(Value::as_str)
            .map(str::to_string);

        ResultOutcome::Error { kind, message, traceback }
    }

    pub fn boot_error(message: impl Into<String>) -> Self {
        Self::typed_error("BootError", message)
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::typed_error("ConfigError", message)
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::typed_error("ConnectionError", message)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::typed_error("ProtocolError", message)
    }

    pub fn json_error(message: impl Into<String>) -> Self {
        Self::typed_error("JSONError", message)
    }

    pub fn timeout() -> Self {
        Self::typed_error("Timeout", "Backtest exceeded the 5 minute wall timeout")
    }

    fn typed_error(kind: &'static str, message: impl Into<String>) -> Self {
        ResultOutcome::Error {
            kind: kind.to_string(),
            message: message.into(),
            traceback: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_flat_tag() {
        let event = StatusEvent::Processing {
            task_id: "abc".into(),
            message: "Booting MicroVM...".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["message"], "Booting MicroVM...");
    }

    #[test]
    fn error_event_carries_type_and_message_per_s3() {
        let outcome = ResultOutcome::protocol_error("payload truncated");
        let event = StatusEvent::error("task-1", outcome);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["type"], "ProtocolError");
        assert_eq!(json["message"], "payload truncated");
        assert!(json.get("traceback").is_none());
    }

    #[test]
    fn outcome_reads_success_report() {
        let value = serde_json::json!({"status": "success", "report": {"metrics": []}});
        match ResultOutcome::from_guest_json(value) {
            ResultOutcome::Success { report } => assert_eq!(report["metrics"], serde_json::json!([])),
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn outcome_reads_strategy_error_shape() {
        let value = serde_json::json!({"status": "error", "error": "SyntaxError: invalid syntax"});
        match ResultOutcome::from_guest_json(value) {
            ResultOutcome::Error { kind, message, .. } => {
                assert_eq!(kind, "StrategyError");
                assert!(message.contains("SyntaxError"));
            }
            _ => panic!("expected error"),
        }
    }
}
