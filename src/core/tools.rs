use std::collections::HashMap;

use serde_json::Value;

/// Outcome of validating a tool input at the chunk-parsing boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInputCheck {
    Valid,
    /// No schema registered for this tool name; accepted as-is so newer
    /// backends keep working against older clients.
    UnknownTool,
    Invalid(String),
}

/// Per-tool-name JSON schema registry. Inputs are checked where chunks are
/// parsed, not where tools run, so a malformed payload never reaches the
/// message model.
#[derive(Default)]
pub struct ToolSchemaRegistry {
    validators: HashMap<String, jsonschema::Validator>,
}

impl ToolSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool_name: &str, schema: &Value) -> Result<(), String> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|err| format!("invalid schema for tool {tool_name}: {err}"))?;
        self.validators.insert(tool_name.to_string(), validator);
        Ok(())
    }

    pub fn check(&self, tool_name: &str, input: &Value) -> ToolInputCheck {
        match self.validators.get(tool_name) {
            None => ToolInputCheck::UnknownTool,
            Some(validator) => match validator.validate(input) {
                Ok(()) => ToolInputCheck::Valid,
                Err(err) => ToolInputCheck::Invalid(err.to_string()),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

type LocalToolFn = Box<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Tools the client executes itself once their approval is granted. The
/// produced result is injected for the original tool call and flushed back
/// to the backend on the next automatic send.
#[derive(Default)]
pub struct LocalExecutorRegistry {
    executors: HashMap<String, LocalToolFn>,
}

impl LocalExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, tool_name: &str, run: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.executors.insert(tool_name.to_string(), Box::new(run));
    }

    pub fn has(&self, tool_name: &str) -> bool {
        self.executors.contains_key(tool_name)
    }

    pub fn run(&self, tool_name: &str, input: &Value) -> Option<Result<Value, String>> {
        self.executors.get(tool_name).map(|run| run(input))
    }
}
