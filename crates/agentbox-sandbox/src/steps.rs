//! Low-code step interpreter
//!
//! A configuration is `{steps: [{type, action, params}], variables}`. Steps
//! run in order, each taking the variable bag and handing back the next one.
//! Only a configuration that is not an object fails the run; anything odd
//! inside a step is logged and skipped.

use crate::completion::CompletionService;
use crate::result::{ExecutionLog, ExecutionResult};
use crate::SandboxError;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Field that receives an ai step's response unless `params.field` says otherwise
pub const AI_RESPONSE_FIELD: &str = "aiResponse";

const AI_SYSTEM_PROMPT_DEFAULT: &str = "You are an AI agent executing one step of a workflow. Answer concisely.";

type Bag = Map<String, Value>;

pub struct StepInterpreter {
    completion: Option<Arc<dyn CompletionService>>,
}

impl StepInterpreter {
    pub fn new(completion: Option<Arc<dyn CompletionService>>) -> Self {
        Self { completion }
    }

    pub async fn execute(&self, config: &Value, input: Option<&Value>) -> ExecutionResult {
        let mut log = ExecutionLog::start();

        let Some(config) = config.as_object() else {
            return log.fail(SandboxError::Configuration(
                "low-code configuration must be a JSON object".to_string(),
            ));
        };

        let mut bag = Bag::new();
        if let Some(Value::Object(variables)) = config.get("variables") {
            bag.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        bag.insert("input".to_string(), input.cloned().unwrap_or(Value::Null));

        let steps = match config.get("steps") {
            Some(Value::Array(steps)) => steps.as_slice(),
            None | Some(Value::Null) => &[],
            Some(_) => {
                log.log("Ignoring 'steps': expected an array");
                &[]
            }
        };

        for (index, step) in steps.iter().enumerate() {
            bag = self.apply(bag, index, steps.len(), step, &mut log).await;
        }

        debug!(steps = steps.len(), "Low-code execution finished");
        log.succeed(Value::Object(bag))
    }

    async fn apply(&self, mut bag: Bag, index: usize, total: usize, step: &Value, log: &mut ExecutionLog) -> Bag {
        let kind = step.get("type").and_then(Value::as_str).unwrap_or("");
        let action = step.get("action").and_then(Value::as_str).unwrap_or("");
        let params = step.get("params").and_then(Value::as_object).cloned().unwrap_or_default();

        log.log(format!("Executing step {}/{}: {} ({})", index + 1, total, kind, action));

        match kind {
            "transform" => transform(&mut bag, action, &params, log),
            "filter" => log.log(format!("Filter '{}' evaluated, variables unchanged", action)),
            "output" => log.log(format!("Output: {}", Value::Object(bag.clone()))),
            "ai" => self.ai(&mut bag, &params, log).await,
            other => log.log(format!("Unknown step type '{}', skipping", other)),
        }
        bag
    }

    async fn ai(&self, bag: &mut Bag, params: &Map<String, Value>, log: &mut ExecutionLog) {
        let field = params
            .get("field")
            .and_then(Value::as_str)
            .unwrap_or(AI_RESPONSE_FIELD)
            .to_string();

        let Some(service) = &self.completion else {
            log.log("AI step skipped: no completion service configured");
            bag.insert(field, Value::Null);
            return;
        };

        let prompt = render_template(params.get("prompt").and_then(Value::as_str).unwrap_or(""), bag);
        let system = params
            .get("systemPrompt")
            .and_then(Value::as_str)
            .map(|s| render_template(s, bag))
            .unwrap_or_else(|| AI_SYSTEM_PROMPT_DEFAULT.to_string());

        match service.complete(&system, &prompt).await {
            Ok(completion) => {
                log.log(format!("AI step completed ({} tokens)", completion.tokens_used));
                bag.insert(field, Value::String(completion.text));
            }
            Err(e) => {
                warn!(error = %e, "Completion service failed, skipping ai step");
                log.log(format!("AI step skipped: {}", e));
                bag.insert(field, Value::Null);
            }
        }
    }
}

fn transform(bag: &mut Bag, action: &str, params: &Map<String, Value>, log: &mut ExecutionLog) {
    let Some(field) = params.get("field").and_then(Value::as_str) else {
        log.log("Transform skipped: missing 'field'");
        return;
    };

    let source = || -> Value {
        if let Some(value) = params.get("value") {
            value.clone()
        } else if let Some(template) = params.get("template").and_then(Value::as_str) {
            Value::String(render_template(template, bag))
        } else if let Some(path) = params.get("from").and_then(Value::as_str) {
            lookup(bag, path).cloned().unwrap_or(Value::Null)
        } else {
            bag.get(field).cloned().unwrap_or(Value::Null)
        }
    };

    let value = match action {
        "map" | "set" | "" => source(),
        "uppercase" => text(&source()).map(|s| Value::String(s.to_uppercase())).unwrap_or(Value::Null),
        "lowercase" => text(&source()).map(|s| Value::String(s.to_lowercase())).unwrap_or(Value::Null),
        "length" => match source() {
            Value::String(s) => Value::from(s.chars().count()),
            Value::Array(items) => Value::from(items.len()),
            Value::Object(map) => Value::from(map.len()),
            _ => Value::from(0),
        },
        other => {
            log.log(format!("Unknown transform action '{}', skipping", other));
            return;
        }
    };
    bag.insert(field.to_string(), value);
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Resolve a dotted path such as `input.user.name`
fn lookup<'a>(bag: &'a Bag, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = bag.get(parts.next()?.trim())?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part.trim())?,
            Value::Array(items) => items.get(part.trim().parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Replace `{{name}}` tokens (dotted paths allowed) with values from the bag.
///
/// Strings are inserted raw, other values as JSON, unknown names as nothing.
pub fn render_template(template: &str, bag: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                match lookup(bag, after[..end].trim()) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(value) => out.push_str(&value.to_string()),
                    None => {}
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{Completion, CompletionError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Canned {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionService for Canned {
        async fn complete(&self, _system: &str, user: &str) -> Result<Completion, CompletionError> {
            self.prompts.lock().push(user.to_string());
            Ok(Completion {
                text: "summary".to_string(),
                tokens_used: 42,
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl CompletionService for Failing {
        async fn complete(&self, _system: &str, _user: &str) -> Result<Completion, CompletionError> {
            Err(CompletionError::Request("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_transform_then_output() {
        let config = json!({
            "steps": [
                {"type": "transform", "action": "map", "params": {"field": "result", "value": "done"}},
                {"type": "output", "action": "log", "params": {}}
            ]
        });
        let result = StepInterpreter::new(None).execute(&config, None).await;

        assert!(result.success);
        assert_eq!(result.output["result"], "done");
        let steps: Vec<_> = result.logs.iter().filter(|l| l.starts_with("Executing step")).collect();
        assert_eq!(steps.len(), 2);
        assert!(steps[0].contains("1/2: transform"));
        assert!(steps[1].contains("2/2: output"));
    }

    #[tokio::test]
    async fn test_variables_and_input_seed_the_bag() {
        let config = json!({
            "variables": {"greeting": "hello"},
            "steps": [
                {"type": "transform", "action": "uppercase", "params": {"field": "loud", "from": "input.name"}},
                {"type": "transform", "action": "map", "params": {"field": "line", "template": "{{greeting}}, {{loud}}"}}
            ]
        });
        let input = json!({"name": "ada"});
        let result = StepInterpreter::new(None).execute(&config, Some(&input)).await;

        assert_eq!(result.output["loud"], "ADA");
        assert_eq!(result.output["line"], "hello, ADA");
        assert_eq!(result.output["input"]["name"], "ada");
    }

    #[tokio::test]
    async fn test_filter_and_unknown_do_not_mutate() {
        let config = json!({
            "variables": {"n": 1},
            "steps": [
                {"type": "filter", "action": "n > 0"},
                {"type": "teleport", "action": "now"}
            ]
        });
        let result = StepInterpreter::new(None).execute(&config, None).await;
        assert!(result.success);
        assert_eq!(result.output, json!({"n": 1, "input": null}));
        assert!(result.logs.iter().any(|l| l.contains("Unknown step type 'teleport'")));
    }

    #[tokio::test]
    async fn test_ai_without_service_is_skipped() {
        let config = json!({"steps": [{"type": "ai", "action": "summarize", "params": {"prompt": "hi"}}]});
        let result = StepInterpreter::new(None).execute(&config, None).await;

        assert!(result.success);
        assert_eq!(result.output[AI_RESPONSE_FIELD], Value::Null);
        assert!(result.logs.iter().any(|l| l.contains("skipped")));
    }

    #[tokio::test]
    async fn test_ai_with_service_renders_prompt() {
        let service = Arc::new(Canned {
            prompts: Mutex::new(Vec::new()),
        });
        let config = json!({
            "variables": {"topic": "rust"},
            "steps": [{"type": "ai", "action": "summarize", "params": {"prompt": "Summarize {{topic}}", "field": "summary"}}]
        });
        let result = StepInterpreter::new(Some(service.clone())).execute(&config, None).await;

        assert_eq!(result.output["summary"], "summary");
        assert_eq!(service.prompts.lock().as_slice(), ["Summarize rust"]);
    }

    #[tokio::test]
    async fn test_ai_service_error_is_not_fatal() {
        let config = json!({"steps": [{"type": "ai", "params": {"prompt": "x"}}]});
        let result = StepInterpreter::new(Some(Arc::new(Failing))).execute(&config, None).await;
        assert!(result.success);
        assert_eq!(result.output[AI_RESPONSE_FIELD], Value::Null);
    }

    #[tokio::test]
    async fn test_non_object_config_fails() {
        for config in [Value::Null, json!([1, 2]), json!("steps")] {
            let result = StepInterpreter::new(None).execute(&config, None).await;
            assert!(!result.success);
            assert!(result.errors[0].contains("Invalid configuration"));
        }
    }

    #[test]
    fn test_render_template() {
        let mut bag = Map::new();
        bag.insert("name".into(), json!("Ada"));
        bag.insert("user".into(), json!({"age": 36, "tags": ["a", "b"]}));

        assert_eq!(render_template("Hi {{ name }}!", &bag), "Hi Ada!");
        assert_eq!(render_template("{{user.age}} {{user.tags.1}}", &bag), "36 b");
        assert_eq!(render_template("[{{missing}}]", &bag), "[]");
        assert_eq!(render_template("open {{name", &bag), "open {{name");
    }
}
