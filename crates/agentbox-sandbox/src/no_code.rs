//! No-code agents
//!
//! A no-code agent is only a prompt. Executing one never reaches the
//! completion service: the result describes the prompt and its context so
//! the caller can run it against whatever provider it owns.

use crate::result::{ExecutionLog, ExecutionResult};
use serde_json::{json, Value};

pub fn passthrough(prompt: &str, context: Option<&Value>) -> ExecutionResult {
    let mut log = ExecutionLog::start();
    log.log(format!("No-code agent prompt received ({} chars)", prompt.chars().count()));

    let context = context.cloned().unwrap_or(Value::Null);
    if let Value::Object(map) = &context {
        log.log(format!("Context keys: {}", map.keys().cloned().collect::<Vec<_>>().join(", ")));
    }

    log.succeed(json!({
        "mode": "no_code",
        "prompt": prompt,
        "context": context,
        "message": "Prompt accepted; completion is left to the caller",
    }))
}
