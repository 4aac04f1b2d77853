//! Execution results
//!
//! [`ExecutionLog`] collects log and error lines in emission order while a
//! call runs, then seals them into an immutable [`ExecutionResult`].

use crate::fuel::FuelMeteringResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::time::Instant;

/// Outcome of one sandboxed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Value,
    pub logs: Vec<String>,
    pub errors: Vec<String>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel: Option<FuelMeteringResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: Value, logs: Vec<String>, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            output,
            logs,
            errors: Vec::new(),
            execution_time_ms,
            memory_used_bytes: None,
            fuel: None,
            backend: None,
        }
    }

    /// A failed result always carries at least one error
    pub fn failure(error: impl Display, logs: Vec<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            output: Value::Null,
            logs,
            errors: vec![error.to_string()],
            execution_time_ms,
            memory_used_bytes: None,
            fuel: None,
            backend: None,
        }
    }

    pub fn with_memory_used(mut self, bytes: u64) -> Self {
        self.memory_used_bytes = Some(bytes);
        self
    }

    pub fn with_fuel(mut self, fuel: FuelMeteringResult) -> Self {
        self.fuel = Some(fuel);
        self
    }

    pub fn with_backend(mut self, name: impl Into<String>) -> Self {
        self.backend = Some(name.into());
        self
    }
}

/// Ordered log/error collector for a single call
#[derive(Debug)]
pub struct ExecutionLog {
    logs: Vec<String>,
    errors: Vec<String>,
    started: Instant,
}

impl ExecutionLog {
    pub fn start() -> Self {
        Self {
            logs: Vec::new(),
            errors: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    pub fn extend_logs<I>(&mut self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.logs.extend(lines);
    }

    pub fn error(&mut self, line: impl Display) {
        self.errors.push(line.to_string());
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Seal as a success. Any recorded error turns it into a failure instead.
    pub fn succeed(self, output: Value) -> ExecutionResult {
        if !self.errors.is_empty() {
            return self.seal(false, Value::Null);
        }
        self.seal(true, output)
    }

    /// Seal as a failure, recording `error` after anything already collected
    pub fn fail(mut self, error: impl Display) -> ExecutionResult {
        self.error(error);
        self.seal(false, Value::Null)
    }

    fn seal(self, success: bool, output: Value) -> ExecutionResult {
        let execution_time_ms = self.elapsed_ms();
        if success {
            return ExecutionResult::success(output, self.logs, execution_time_ms);
        }
        ExecutionResult {
            errors: self.errors,
            ..ExecutionResult::failure("", self.logs, execution_time_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logs_keep_emission_order() {
        let mut log = ExecutionLog::start();
        log.log("first");
        log.log("second");
        log.extend_logs(vec!["third".to_string()]);
        let result = log.succeed(json!(1));
        assert!(result.success);
        assert_eq!(result.logs, vec!["first", "second", "third"]);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_failure_has_error_and_null_output() {
        let mut log = ExecutionLog::start();
        log.log("about to fail");
        let result = log.fail("boom");
        assert!(!result.success);
        assert_eq!(result.output, Value::Null);
        assert_eq!(result.errors, vec!["boom"]);
        assert_eq!(result.logs, vec!["about to fail"]);
    }

    #[test]
    fn test_succeed_with_recorded_error_is_failure() {
        let mut log = ExecutionLog::start();
        log.error("late fault");
        let result = log.succeed(json!({"ok": true}));
        assert!(!result.success);
        assert_eq!(result.output, Value::Null);
    }

    #[test]
    fn test_serializes_camel_case() {
        let result = ExecutionLog::start().succeed(json!(4)).with_memory_used(10);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["memoryUsedBytes"], 10);
        assert!(value.get("executionTimeMs").is_some());
        assert!(value.get("fuel").is_none());
    }

    #[test]
    fn test_constructors() {
        let ok = ExecutionResult::success(json!("done"), vec!["step".into()], 3);
        assert!(ok.success);
        assert!(ok.errors.is_empty());

        let failed = ExecutionResult::failure("Fuel limit exceeded", Vec::new(), 1);
        assert!(!failed.success);
        assert_eq!(failed.errors, vec!["Fuel limit exceeded"]);
        assert_eq!(failed.output, Value::Null);
    }
}
